use crate::model::{LookupParameter, Parameter};
use dyngraph_core::{Device, Dim, Error, Result};
use std::sync::Arc;

/// Index of a node's output slot in one [`ComputationGraph`](crate::graph::ComputationGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarIndex(pub(crate) u32);

impl VarIndex {
    /// As usize
    #[must_use]
    pub const fn i(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for VarIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One operation instance.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) args: Vec<VarIndex>,
    pub(crate) dim: Dim,
    pub(crate) device: Arc<Device>,
    pub(crate) op: Op,
}

impl Node {
    /// Argument slots
    #[must_use]
    pub fn args(&self) -> &[VarIndex] {
        &self.args
    }

    /// Output dim
    #[must_use]
    pub const fn dim(&self) -> Dim {
        self.dim
    }

    /// Device the output lives on
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Operation
    #[must_use]
    pub const fn op(&self) -> &Op {
        &self.op
    }
}

/// Operation catalogue.
///
/// Source ops (`Input`, `Parameter`, `ConstParameter`, `Lookup`) take no
/// arguments; all others read their arguments' values.
#[derive(Debug, Clone)]
pub enum Op {
    /// Constant host data, row-major per batch element
    Input {
        /// Shape of the data
        dim: Dim,
        /// `dim.total()` values
        data: Vec<f32>,
    },
    /// Dense parameter whose gradient flows back to the model
    Parameter(Parameter),
    /// Dense parameter read without gradient
    ConstParameter(Parameter),
    /// Rows of a lookup table, one per batch element
    Lookup {
        /// Table
        param: LookupParameter,
        /// Row per batch element
        indices: Vec<usize>,
    },
    /// `x0 + x1 + ...`, broadcasting
    Sum,
    /// `x0 - x1`, broadcasting
    Sub,
    /// `-x`
    Negate,
    /// `x0 * x1` elementwise, broadcasting
    CwiseMultiply,
    /// `x0 / x1` elementwise, broadcasting
    CwiseQuotient,
    /// `x0 ^ x1` with a single element exponent
    Pow,
    /// `x0 · x1`
    MatrixMultiply,
    /// `b + W1 · x1 + W2 · x2 + ...`, args `[b, W1, x1, W2, x2, ...]`
    AffineTransform,
    /// `tanh(x)`
    Tanh,
    /// `1 / (1 + e^-x)`
    Logistic,
    /// `max(x, 0)`
    Rectify,
    /// `e^x`
    Exp,
    /// `ln(x)`
    Log,
    /// `x^2`
    Square,
    /// `sqrt(x)`
    Sqrt,
    /// Sum of the elements of each batch element
    SumElements,
    /// Sum over the batch axis
    SumBatches,
    /// `x - logsumexp(x)` of a column vector
    LogSoftmax,
    /// Element of a vector, one index per batch element (or one for all)
    PickElement {
        /// Picked row per batch element
        indices: Vec<usize>,
    },
    /// `||x0 - x1||^2`
    SquaredDistance,
    /// Stack along the first axis
    Concatenate,
    /// Same values, new per-batch shape
    Reshape(Dim),
    /// Copy to the node's device from the argument's device
    ToDevice,
}

fn unary(op: &'static str, xs: &[Dim]) -> Result<Dim> {
    match xs {
        [x] => Ok(*x),
        _ => Err(Error::dimension_mismatch(op, xs.iter().copied())),
    }
}

fn batch_compatible(xs: &[Dim]) -> Option<usize> {
    xs.iter().try_fold(1, |bd, x| match (bd, x.bd()) {
        (a, b) if a == b => Some(a),
        (1, b) => Some(b),
        (a, 1) => Some(a),
        _ => None,
    })
}

fn matmul_dim(op: &'static str, a: Dim, b: Dim) -> Result<Dim> {
    let err = || Error::dimension_mismatch(op, [a, b]);
    if a.nd() > 2 || b.nd() > 2 || a.cols() != b.rows() {
        return Err(err());
    }
    let bd = batch_compatible(&[a, b]).ok_or_else(err)?;
    Ok(Dim::batched(&[a.rows(), b.cols()], bd).truncate())
}

impl Op {
    /// Operation name used in errors and graph dumps
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Parameter(_) => "parameter",
            Op::ConstParameter(_) => "const_parameter",
            Op::Lookup { .. } => "lookup",
            Op::Sum => "sum",
            Op::Sub => "sub",
            Op::Negate => "negate",
            Op::CwiseMultiply => "cwise_multiply",
            Op::CwiseQuotient => "cwise_quotient",
            Op::Pow => "pow",
            Op::MatrixMultiply => "matmul",
            Op::AffineTransform => "affine_transform",
            Op::Tanh => "tanh",
            Op::Logistic => "logistic",
            Op::Rectify => "rectify",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Square => "square",
            Op::Sqrt => "sqrt",
            Op::SumElements => "sum_elements",
            Op::SumBatches => "sum_batches",
            Op::LogSoftmax => "log_softmax",
            Op::PickElement { .. } => "pick",
            Op::SquaredDistance => "squared_distance",
            Op::Concatenate => "concatenate",
            Op::Reshape(_) => "reshape",
            Op::ToDevice => "to_device",
        }
    }

    /// True for ops that take no arguments.
    #[must_use]
    pub const fn is_source(&self) -> bool {
        matches!(
            self,
            Op::Input { .. } | Op::Parameter(_) | Op::ConstParameter(_) | Op::Lookup { .. }
        )
    }

    /// True for ops whose gradient ends up in a model.
    #[must_use]
    pub const fn is_trainable(&self) -> bool {
        matches!(self, Op::Parameter(_) | Op::Lookup { .. })
    }

    /// True for ops that compute each batch element independently, so
    /// stacking their inputs along the batch axis stacks their outputs.
    #[must_use]
    pub const fn supports_multibatch(&self) -> bool {
        !matches!(
            self,
            Op::Input { .. }
                | Op::Parameter(_)
                | Op::ConstParameter(_)
                | Op::SumBatches
                | Op::ToDevice
        )
    }

    /// Output dim for arguments of dims `xs`.
    pub fn dim_forward(&self, xs: &[Dim]) -> Result<Dim> {
        let name = self.name();
        let mismatch = || Error::dimension_mismatch(name, xs.iter().copied());
        match self {
            Op::Input { dim, data } => {
                if data.len() != dim.total() {
                    return Err(Error::ElementCountMismatch {
                        dim: *dim,
                        expected: dim.total(),
                        got: data.len(),
                    });
                }
                Ok(*dim)
            }
            Op::Parameter(p) | Op::ConstParameter(p) => p.dim(),
            Op::Lookup { param, indices } => {
                let count = param.count()?;
                if let Some(&bad) = indices.iter().find(|&&i| i >= count) {
                    return Err(Error::IndexOutOfBounds {
                        index: bad,
                        len: count,
                    });
                }
                if indices.is_empty() {
                    return Err(Error::IndexOutOfBounds { index: 0, len: 0 });
                }
                Ok(param.dim()?.with_bd(indices.len()))
            }
            Op::Sum => {
                let (first, rest) = xs.split_first().ok_or_else(mismatch)?;
                rest.iter()
                    .try_fold(*first, |acc, x| acc.broadcast(x))
                    .ok_or_else(mismatch)
            }
            Op::Sub | Op::CwiseMultiply | Op::CwiseQuotient => match xs {
                [a, b] => a.broadcast(b).ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            Op::Pow => match xs {
                [x, p] if p.total() == 1 => Ok(*x),
                _ => Err(mismatch()),
            },
            Op::MatrixMultiply => match xs {
                [a, b] => matmul_dim(name, *a, *b),
                _ => Err(mismatch()),
            },
            Op::AffineTransform => {
                if xs.len() % 2 == 0 {
                    return Err(mismatch());
                }
                let mut out = xs[0];
                for pair in xs[1..].chunks(2) {
                    let prod = matmul_dim(name, pair[0], pair[1])?;
                    if !prod.same_shape(&out) {
                        return Err(mismatch());
                    }
                    out = out.broadcast(&prod).ok_or_else(mismatch)?;
                }
                Ok(out)
            }
            Op::Negate
            | Op::Tanh
            | Op::Logistic
            | Op::Rectify
            | Op::Exp
            | Op::Log
            | Op::Square
            | Op::Sqrt
            | Op::ToDevice => unary(name, xs),
            Op::SumElements => unary(name, xs).map(|x| Dim::batched(&[1], x.bd())),
            Op::SumBatches => unary(name, xs).map(|x| x.single_batch()),
            Op::LogSoftmax => match xs {
                [x] if x.truncate().nd() == 1 => Ok(*x),
                _ => Err(mismatch()),
            },
            Op::PickElement { indices } => {
                let x = unary(name, xs)?;
                if x.truncate().nd() != 1 {
                    return Err(mismatch());
                }
                if let Some(&bad) = indices.iter().find(|&&i| i >= x.rows()) {
                    return Err(Error::IndexOutOfBounds {
                        index: bad,
                        len: x.rows(),
                    });
                }
                let bd = match (x.bd(), indices.len()) {
                    (_, 0) => return Err(Error::IndexOutOfBounds { index: 0, len: 0 }),
                    (a, 1) => a,
                    (1, n) => n,
                    (a, n) if a == n => a,
                    _ => return Err(mismatch()),
                };
                Ok(Dim::batched(&[1], bd))
            }
            Op::SquaredDistance => match xs {
                [a, b] if a.same_shape(b) => batch_compatible(xs)
                    .map(|bd| Dim::batched(&[1], bd))
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            Op::Concatenate => {
                let (first, _) = xs.split_first().ok_or_else(mismatch)?;
                let nd = xs.iter().map(Dim::nd).max().unwrap_or(1);
                let tail = |d: &Dim| (1..nd).map(|k| d.get(k)).collect::<Vec<_>>();
                if xs.iter().any(|x| tail(x) != tail(first)) {
                    return Err(mismatch());
                }
                let bd = batch_compatible(xs).ok_or_else(mismatch)?;
                let mut axes = vec![xs.iter().map(Dim::rows).sum()];
                axes.extend(tail(first));
                Ok(Dim::batched(&axes, bd))
            }
            Op::Reshape(to) => {
                let x = unary(name, xs)?;
                if x.size() != to.size() {
                    return Err(mismatch());
                }
                Ok(to.with_bd(x.bd()))
            }
        }
    }
}
