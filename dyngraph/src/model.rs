//! Persistent parameters.
//!
//! A [`Model`] owns dense and lookup parameters allocated from its device's
//! parameter arena. Graphs refer to them through [`Parameter`] and
//! [`LookupParameter`] handles, and every backward pass adds into their
//! gradient accumulators until they are cleared.

use dyngraph_core::mutex::Mutex;
use dyngraph_core::{init, BufferId, Device, DeviceMemory, Dim, Error, PoolRole, Result, Tensor};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How new parameter values are drawn.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterInit {
    /// Glorot (Xavier) uniform
    Glorot,
    /// Uniform in `[-scale, scale)`
    Uniform(f32),
    /// Normal distribution
    Normal {
        /// Mean
        mean: f32,
        /// Standard deviation
        std: f32,
    },
    /// Every element the same value
    Const(f32),
    /// Orthonormal, scaled by the gain
    Saxe(f32),
    /// Explicit row-major values
    FromVec(Vec<f32>),
}

impl ParameterInit {
    /// Values for one tensor of `dim` (batch axis ignored).
    pub fn values(&self, dim: Dim) -> Result<Vec<f32>> {
        let n = dim.size();
        Ok(match self {
            ParameterInit::Glorot => init::glorot(dim)?,
            ParameterInit::Uniform(scale) => init::uniform(n, *scale)?,
            ParameterInit::Normal { mean, std } => init::normal(n, *mean, *std),
            ParameterInit::Const(v) => vec![*v; n],
            ParameterInit::Saxe(gain) => init::saxe(dim, *gain),
            ParameterInit::FromVec(data) => {
                if data.len() != n {
                    return Err(Error::ElementCountMismatch {
                        dim,
                        expected: n,
                        got: data.len(),
                    });
                }
                data.clone()
            }
        })
    }
}

fn check_len(dim: Dim, data: &[f32]) -> Result<()> {
    if data.len() != dim.size() {
        return Err(Error::ElementCountMismatch {
            dim,
            expected: dim.size(),
            got: data.len(),
        });
    }
    Ok(())
}

/// Dense parameter with its gradient accumulator.
#[derive(Debug)]
pub struct ParameterStorage {
    dim: Dim,
    values: BufferId,
    gradient: BufferId,
    device: Arc<Device>,
}

impl ParameterStorage {
    /// Allocates values and a zeroed gradient from `device`'s parameter arena.
    pub fn new(device: &Arc<Device>, dim: Dim, init: &ParameterInit) -> Result<ParameterStorage> {
        let dim = dim.single_batch();
        let data = init.values(dim)?;
        let (values, gradient) = allocate_values_and_gradient(&mut device.lock(), &data)?;
        Ok(ParameterStorage {
            dim,
            values,
            gradient,
            device: Arc::clone(device),
        })
    }

    /// Shape
    #[must_use]
    pub const fn dim(&self) -> Dim {
        self.dim
    }

    /// Number of floats
    #[must_use]
    pub fn size(&self) -> usize {
        self.dim.size()
    }

    /// Device holding the values
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Values as a tensor view
    pub fn values(&self) -> Result<Tensor> {
        Tensor::new(self.dim, self.values, Arc::clone(&self.device))
    }

    /// Gradient accumulator as a tensor view
    pub fn gradient(&self) -> Result<Tensor> {
        Tensor::new(self.dim, self.gradient, Arc::clone(&self.device))
    }

    pub(crate) const fn values_buffer(&self) -> &BufferId {
        &self.values
    }

    /// Adds `contribution` into the gradient.
    pub fn accumulate_grad(&self, contribution: &[f32]) -> Result<()> {
        check_len(self.dim, contribution)?;
        self.device.lock().accumulate(&self.gradient, contribution)
    }

    /// Zeroes the gradient.
    pub fn clear_gradients(&self) -> Result<()> {
        self.device.lock().fill(&self.gradient, 0.0)
    }

    /// Zeroes the values.
    pub fn zero(&self) -> Result<()> {
        self.device.lock().fill(&self.values, 0.0)
    }

    /// Overwrites the values.
    pub fn set_values(&self, data: &[f32]) -> Result<()> {
        check_len(self.dim, data)?;
        self.device.lock().write(&self.values, data)
    }

    /// Copies values from `other`, which may live on another device.
    pub fn copy_from(&self, other: &ParameterStorage) -> Result<()> {
        if !self.dim.same_shape(&other.dim) {
            return Err(Error::dimension_mismatch("copy", [self.dim, other.dim]));
        }
        let data = other.values()?.to_vec()?;
        self.set_values(&data)
    }

    /// Multiplies the values by `a`.
    pub fn scale_parameters(&self, a: f32) -> Result<()> {
        self.device
            .lock()
            .slice_mut(&self.values)?
            .iter_mut()
            .for_each(|v| *v *= a);
        Ok(())
    }

    /// Multiplies the gradient by `a`.
    pub fn scale_gradient(&self, a: f32) -> Result<()> {
        self.device
            .lock()
            .slice_mut(&self.gradient)?
            .iter_mut()
            .for_each(|v| *v *= a);
        Ok(())
    }

    /// Sum of squared values
    pub fn squared_l2norm(&self) -> Result<f32> {
        let mem = self.device.lock();
        Ok(self.device.executor().squared_norm(mem.slice(&self.values)?))
    }

    /// Sum of squared gradient elements
    pub fn g_squared_l2norm(&self) -> Result<f32> {
        let mem = self.device.lock();
        Ok(self.device.executor().squared_norm(mem.slice(&self.gradient)?))
    }
}

/// Lookup table: `count` rows of `dim`, each with its own gradient.
///
/// Rows whose gradient may be non-zero are tracked in a touched set, so
/// clearing gradients only visits those rows.
#[derive(Debug)]
pub struct LookupParameterStorage {
    dim: Dim,
    count: usize,
    values: BufferId,
    gradient: BufferId,
    touched: Mutex<BTreeSet<usize>>,
    device: Arc<Device>,
}

impl LookupParameterStorage {
    /// Allocates `count` rows, each initialized independently with `init`,
    /// and zeroed gradients.
    pub fn new(device: &Arc<Device>, count: usize, dim: Dim, init: &ParameterInit) -> Result<LookupParameterStorage> {
        let dim = dim.single_batch();
        let mut data = Vec::with_capacity(count * dim.size());
        for _ in 0..count {
            data.extend(init.values(dim)?);
        }
        let (values, gradient) = allocate_values_and_gradient(&mut device.lock(), &data)?;
        Ok(LookupParameterStorage {
            dim,
            count,
            values,
            gradient,
            touched: Mutex::new(BTreeSet::new()),
            device: Arc::clone(device),
        })
    }

    /// Shape of one row
    #[must_use]
    pub const fn dim(&self) -> Dim {
        self.dim
    }

    /// Number of rows
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Number of floats over all rows
    #[must_use]
    pub fn size(&self) -> usize {
        self.count * self.dim.size()
    }

    /// Device holding the table
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn row_buffer(&self, row: usize) -> Result<BufferId> {
        row_of(&self.values, row, self.count, self.dim)
    }

    fn row_gradient_buffer(&self, row: usize) -> Result<BufferId> {
        row_of(&self.gradient, row, self.count, self.dim)
    }

    /// Values of `row`
    pub fn row(&self, row: usize) -> Result<Tensor> {
        Tensor::new(self.dim, self.row_buffer(row)?, Arc::clone(&self.device))
    }

    /// Gradient of `row`
    pub fn row_gradient(&self, row: usize) -> Result<Tensor> {
        Tensor::new(self.dim, self.row_gradient_buffer(row)?, Arc::clone(&self.device))
    }

    /// Rows with a possibly non-zero gradient, ascending.
    #[must_use]
    pub fn touched_rows(&self) -> Vec<usize> {
        self.touched.lock().iter().copied().collect()
    }

    /// Adds `contribution` into the gradient of `row` and marks it touched.
    pub fn accumulate_grad(&self, row: usize, contribution: &[f32]) -> Result<()> {
        check_len(self.dim, contribution)?;
        self.device
            .lock()
            .accumulate(&self.row_gradient_buffer(row)?, contribution)?;
        self.touched.lock().insert(row);
        Ok(())
    }

    /// Zeroes the gradients of touched rows and empties the touched set.
    pub fn clear_gradients(&self) -> Result<()> {
        let mut mem = self.device.lock();
        let mut touched = self.touched.lock();
        for &row in touched.iter() {
            mem.fill(&self.row_gradient_buffer(row)?, 0.0)?;
        }
        touched.clear();
        Ok(())
    }

    /// Overwrites the values of `row`.
    pub fn initialize(&self, row: usize, data: &[f32]) -> Result<()> {
        check_len(self.dim, data)?;
        self.device.lock().write(&self.row_buffer(row)?, data)
    }

    /// Zeroes all values.
    pub fn zero(&self) -> Result<()> {
        self.device.lock().fill(&self.values, 0.0)
    }

    /// Copies all rows from `other`, which may live on another device.
    pub fn copy_from(&self, other: &LookupParameterStorage) -> Result<()> {
        if self.count != other.count || !self.dim.same_shape(&other.dim) {
            return Err(Error::dimension_mismatch(
                "copy",
                [self.dim.with_bd(self.count), other.dim.with_bd(other.count)],
            ));
        }
        let data = other.device.read(&other.values)?;
        self.device.lock().write(&self.values, &data)
    }

    /// Multiplies all values by `a`.
    pub fn scale_parameters(&self, a: f32) -> Result<()> {
        self.device
            .lock()
            .slice_mut(&self.values)?
            .iter_mut()
            .for_each(|v| *v *= a);
        Ok(())
    }

    /// Multiplies the gradients of touched rows by `a`.
    pub fn scale_gradient(&self, a: f32) -> Result<()> {
        let mut mem = self.device.lock();
        for &row in self.touched.lock().iter() {
            mem.slice_mut(&self.row_gradient_buffer(row)?)?
                .iter_mut()
                .for_each(|v| *v *= a);
        }
        Ok(())
    }

    /// Sum of squared values over all rows
    pub fn squared_l2norm(&self) -> Result<f32> {
        let mem = self.device.lock();
        Ok(self.device.executor().squared_norm(mem.slice(&self.values)?))
    }

    /// Sum of squared gradient elements. Only touched rows can contribute.
    pub fn g_squared_l2norm(&self) -> Result<f32> {
        let mem = self.device.lock();
        let exec = self.device.executor();
        let mut sum = 0.0;
        for &row in self.touched.lock().iter() {
            sum += exec.squared_norm(mem.slice(&self.row_gradient_buffer(row)?)?);
        }
        Ok(sum)
    }
}

/// One parameter arena allocation holding `data` followed by a zeroed
/// gradient of the same length. Either both halves exist or nothing was
/// allocated.
fn allocate_values_and_gradient(mem: &mut DeviceMemory, data: &[f32]) -> Result<(BufferId, BufferId)> {
    let n = data.len();
    let both = mem.allocate_zeroed(PoolRole::Parameters, 2 * n)?;
    let split = both.sub(0, n).zip(both.sub(n, n));
    let (values, gradient) = split.ok_or(Error::IndexOutOfBounds { index: 2 * n, len: both.len() })?;
    mem.write(&values, data)?;
    Ok((values, gradient))
}

fn row_of(buf: &BufferId, row: usize, count: usize, dim: Dim) -> Result<BufferId> {
    if row >= count {
        return Err(Error::IndexOutOfBounds { index: row, len: count });
    }
    buf.sub(row * dim.size(), dim.size())
        .ok_or(Error::IndexOutOfBounds { index: row, len: count })
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Dense(usize),
    Lookup(usize),
}

#[derive(Debug, Default)]
struct Store {
    params: Vec<Arc<ParameterStorage>>,
    lookups: Vec<Arc<LookupParameterStorage>>,
    order: Vec<Slot>,
}

struct ModelInner {
    device: Arc<Device>,
    store: Mutex<Store>,
}

/// Collection of parameters living on one device.
///
/// Cloning a model clones a handle; all clones share the same storage.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl core::fmt::Debug for Model {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let store = self.inner.store.lock();
        f.debug_struct("Model")
            .field("device", &self.inner.device.name())
            .field("parameters", &store.params.len())
            .field("lookup_parameters", &store.lookups.len())
            .finish()
    }
}

/// One stored parameter, yielded in creation order by [`Model::iter`].
#[derive(Debug, Clone)]
pub enum ModelStorage {
    /// Dense parameter
    Dense(Arc<ParameterStorage>),
    /// Lookup table
    Lookup(Arc<LookupParameterStorage>),
}

impl ModelStorage {
    /// Shape of the parameter, or of one row for lookup tables
    #[must_use]
    pub fn dim(&self) -> Dim {
        match self {
            ModelStorage::Dense(p) => p.dim(),
            ModelStorage::Lookup(p) => p.dim(),
        }
    }
}

/// Host copy of one parameter, for external serializers.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterEntry {
    /// Dense parameter values
    Dense {
        /// Shape
        dim: Dim,
        /// Row-major values
        values: Vec<f32>,
    },
    /// Lookup table rows
    Lookup {
        /// Shape of one row
        dim: Dim,
        /// One vector per row
        rows: Vec<Vec<f32>>,
    },
}

impl ParameterEntry {
    /// Shape of the parameter, or of one row for lookup tables
    #[must_use]
    pub const fn dim(&self) -> Dim {
        match self {
            ParameterEntry::Dense { dim, .. } | ParameterEntry::Lookup { dim, .. } => *dim,
        }
    }
}

impl Model {
    /// Empty model whose parameters live on `device`.
    #[must_use]
    pub fn on(device: &Arc<Device>) -> Model {
        Model {
            inner: Arc::new(ModelInner {
                device: Arc::clone(device),
                store: Mutex::new(Store::default()),
            }),
        }
    }

    /// Empty model on the process default device.
    pub fn new() -> Result<Model> {
        Ok(Model::on(&dyngraph_core::default_device()?))
    }

    /// Device holding the parameters
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// Adds a dense parameter, uniform in `[-scale, scale)`, or all zeros
    /// when `scale` is 0. Its gradient starts at zero.
    pub fn add_parameters(&self, dim: Dim, scale: f32) -> Result<Parameter> {
        let init = if scale == 0.0 {
            ParameterInit::Const(0.0)
        } else {
            ParameterInit::Uniform(scale)
        };
        self.add_parameters_with(dim, &init)
    }

    /// Adds a dense parameter initialized with `init`.
    pub fn add_parameters_with(&self, dim: Dim, init: &ParameterInit) -> Result<Parameter> {
        let storage = Arc::new(ParameterStorage::new(&self.inner.device, dim, init)?);
        let mut store = self.inner.store.lock();
        let index = store.params.len();
        store.params.push(storage);
        store.order.push(Slot::Dense(index));
        Ok(Parameter {
            model: self.clone(),
            index,
        })
    }

    /// Adds a lookup table of `count` Glorot initialized rows.
    pub fn add_lookup_parameters(&self, count: usize, dim: Dim) -> Result<LookupParameter> {
        self.add_lookup_parameters_with(count, dim, &ParameterInit::Glorot)
    }

    /// Adds a lookup table whose rows are initialized with `init`.
    pub fn add_lookup_parameters_with(&self, count: usize, dim: Dim, init: &ParameterInit) -> Result<LookupParameter> {
        let storage = Arc::new(LookupParameterStorage::new(&self.inner.device, count, dim, init)?);
        let mut store = self.inner.store.lock();
        let index = store.lookups.len();
        store.lookups.push(storage);
        store.order.push(Slot::Lookup(index));
        Ok(LookupParameter {
            model: self.clone(),
            index,
        })
    }

    /// Dense parameters in creation order
    #[must_use]
    pub fn parameters_list(&self) -> Vec<Arc<ParameterStorage>> {
        self.inner.store.lock().params.clone()
    }

    /// Lookup tables in creation order
    #[must_use]
    pub fn lookup_parameters_list(&self) -> Vec<Arc<LookupParameterStorage>> {
        self.inner.store.lock().lookups.clone()
    }

    /// All parameters, dense and lookup interleaved in creation order.
    pub fn iter(&self) -> impl Iterator<Item = ModelStorage> {
        let store = self.inner.store.lock();
        let items = store
            .order
            .iter()
            .map(|slot| match *slot {
                Slot::Dense(i) => ModelStorage::Dense(Arc::clone(&store.params[i])),
                Slot::Lookup(i) => ModelStorage::Lookup(Arc::clone(&store.lookups[i])),
            })
            .collect::<Vec<_>>();
        items.into_iter()
    }

    /// Number of floats over all parameters
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.iter()
            .map(|s| match s {
                ModelStorage::Dense(p) => p.size(),
                ModelStorage::Lookup(p) => p.size(),
            })
            .sum()
    }

    /// Clears every gradient accumulator.
    pub fn reset_gradient(&self) -> Result<()> {
        for storage in self.iter() {
            match storage {
                ModelStorage::Dense(p) => p.clear_gradients()?,
                ModelStorage::Lookup(p) => p.clear_gradients()?,
            }
        }
        Ok(())
    }

    /// Sum of squared values over all parameters
    pub fn squared_l2_norm(&self) -> Result<f32> {
        self.iter().try_fold(0.0, |acc, s| {
            Ok::<_, Error>(
                acc + match s {
                    ModelStorage::Dense(p) => p.squared_l2norm()?,
                    ModelStorage::Lookup(p) => p.squared_l2norm()?,
                },
            )
        })
    }

    /// L2 norm of all gradients together
    pub fn gradient_l2_norm(&self) -> Result<f32> {
        let sum = self.iter().try_fold(0.0, |acc, s| {
            Ok::<_, Error>(
                acc + match s {
                    ModelStorage::Dense(p) => p.g_squared_l2norm()?,
                    ModelStorage::Lookup(p) => p.g_squared_l2norm()?,
                },
            )
        })?;
        Ok(sum.sqrt())
    }

    /// Multiplies every value by `a`.
    pub fn scale_parameters(&self, a: f32) -> Result<()> {
        for storage in self.iter() {
            match storage {
                ModelStorage::Dense(p) => p.scale_parameters(a)?,
                ModelStorage::Lookup(p) => p.scale_parameters(a)?,
            }
        }
        Ok(())
    }

    /// Multiplies every gradient by `a`.
    pub fn scale_gradient(&self, a: f32) -> Result<()> {
        for storage in self.iter() {
            match storage {
                ModelStorage::Dense(p) => p.scale_gradient(a)?,
                ModelStorage::Lookup(p) => p.scale_gradient(a)?,
            }
        }
        Ok(())
    }

    /// Rescales all parameters together so their joint L2 norm is at most
    /// `radius`. Returns the norm before projection.
    pub fn project_weights(&self, radius: f32) -> Result<f32> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(Error::InvalidConfig(format!("projection radius must be positive, got {radius}")));
        }
        let norm = self.squared_l2_norm()?.sqrt();
        tracing::debug!(norm, radius, "project weights");
        if norm > radius {
            self.scale_parameters(radius / norm)?;
        }
        Ok(norm)
    }

    /// Host copies of every parameter, in creation order.
    pub fn snapshot(&self) -> Result<Vec<ParameterEntry>> {
        self.iter()
            .map(|s| match s {
                ModelStorage::Dense(p) => Ok(ParameterEntry::Dense {
                    dim: p.dim(),
                    values: p.values()?.to_vec()?,
                }),
                ModelStorage::Lookup(p) => Ok(ParameterEntry::Lookup {
                    dim: p.dim(),
                    rows: (0..p.count())
                        .map(|r| p.row(r)?.to_vec())
                        .collect::<Result<_>>()?,
                }),
            })
            .collect()
    }

    /// Restores values saved by [`Model::snapshot`] into a model with the
    /// same parameters in the same order.
    pub fn restore(&self, entries: &[ParameterEntry]) -> Result<()> {
        let storages = self.iter().collect::<Vec<_>>();
        if storages.len() != entries.len() {
            return Err(Error::IndexOutOfBounds {
                index: entries.len(),
                len: storages.len(),
            });
        }
        for (storage, entry) in storages.iter().zip(entries) {
            match (storage, entry) {
                (ModelStorage::Dense(p), ParameterEntry::Dense { dim, values }) if p.dim().same_shape(dim) => {
                    p.set_values(values)?;
                }
                (ModelStorage::Lookup(p), ParameterEntry::Lookup { dim, rows })
                    if p.dim().same_shape(dim) && p.count() == rows.len() =>
                {
                    for (r, row) in rows.iter().enumerate() {
                        p.initialize(r, row)?;
                    }
                }
                (storage, entry) => {
                    return Err(Error::dimension_mismatch("restore", [storage.dim(), entry.dim()]));
                }
            }
        }
        Ok(())
    }

    fn dense(&self, index: usize) -> Result<Arc<ParameterStorage>> {
        let store = self.inner.store.lock();
        store.params.get(index).cloned().ok_or(Error::IndexOutOfBounds {
            index,
            len: store.params.len(),
        })
    }

    fn lookup(&self, index: usize) -> Result<Arc<LookupParameterStorage>> {
        let store = self.inner.store.lock();
        store.lookups.get(index).cloned().ok_or(Error::IndexOutOfBounds {
            index,
            len: store.lookups.len(),
        })
    }
}

/// Handle to a dense parameter: a model reference plus an index.
#[derive(Clone)]
pub struct Parameter {
    model: Model,
    index: usize,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Parameter(#{})", self.index)
    }
}

impl Parameter {
    /// Live storage behind the handle.
    pub fn storage(&self) -> Result<Arc<ParameterStorage>> {
        self.model.dense(self.index)
    }

    /// Owning model
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Index in the owning model
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Shape
    pub fn dim(&self) -> Result<Dim> {
        Ok(self.storage()?.dim())
    }

    /// Zeroes the values.
    pub fn zero(&self) -> Result<()> {
        self.storage()?.zero()
    }

    /// Host copy of the values
    pub fn values(&self) -> Result<Vec<f32>> {
        self.storage()?.values()?.to_vec()
    }

    /// Host copy of the accumulated gradient
    pub fn gradient(&self) -> Result<Vec<f32>> {
        self.storage()?.gradient()?.to_vec()
    }

    /// Overwrites the values.
    pub fn set_values(&self, data: &[f32]) -> Result<()> {
        self.storage()?.set_values(data)
    }

    /// Zeroes the gradient.
    pub fn clear_gradients(&self) -> Result<()> {
        self.storage()?.clear_gradients()
    }
}

/// Handle to a lookup table: a model reference plus an index.
#[derive(Clone)]
pub struct LookupParameter {
    model: Model,
    index: usize,
}

impl core::fmt::Debug for LookupParameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LookupParameter(#{})", self.index)
    }
}

impl LookupParameter {
    /// Live storage behind the handle.
    pub fn storage(&self) -> Result<Arc<LookupParameterStorage>> {
        self.model.lookup(self.index)
    }

    /// Owning model
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Index in the owning model
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Shape of one row
    pub fn dim(&self) -> Result<Dim> {
        Ok(self.storage()?.dim())
    }

    /// Number of rows
    pub fn count(&self) -> Result<usize> {
        Ok(self.storage()?.count())
    }

    /// Zeroes all rows.
    pub fn zero(&self) -> Result<()> {
        self.storage()?.zero()
    }

    /// Overwrites one row.
    pub fn initialize(&self, row: usize, data: &[f32]) -> Result<()> {
        self.storage()?.initialize(row, data)
    }

    /// Host copy of one row
    pub fn row(&self, row: usize) -> Result<Vec<f32>> {
        self.storage()?.row(row)?.to_vec()
    }

    /// Host copy of one row's gradient
    pub fn row_gradient(&self, row: usize) -> Result<Vec<f32>> {
        self.storage()?.row_gradient(row)?.to_vec()
    }

    /// Clears touched rows.
    pub fn clear_gradients(&self) -> Result<()> {
        self.storage()?.clear_gradients()
    }

    /// Rows with a possibly non-zero gradient
    pub fn touched_rows(&self) -> Result<Vec<usize>> {
        Ok(self.storage()?.touched_rows())
    }

    pub(crate) fn table_key(&self) -> (usize, usize) {
        (Arc::as_ptr(&self.model.inner) as usize, self.index)
    }
}
