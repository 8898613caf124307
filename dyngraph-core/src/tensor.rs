use crate::arena::BufferId;
use crate::device::Device;
use crate::dim::Dim;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Non-owning view of a buffer in one of a device's arenas.
///
/// The view stays valid until its arena is reverted past it; reading a
/// view after that fails with [`Error::StaleBuffer`] unless the memory was
/// reallocated in the meantime.
#[derive(Debug, Clone)]
pub struct Tensor {
    dim: Dim,
    buf: BufferId,
    device: Arc<Device>,
}

impl Tensor {
    /// View of `buf` on `device` shaped as `dim`.
    pub fn new(dim: Dim, buf: BufferId, device: Arc<Device>) -> Result<Tensor> {
        device.check_buffer(&buf)?;
        if buf.len() != dim.total() {
            return Err(Error::ElementCountMismatch {
                dim,
                expected: dim.total(),
                got: buf.len(),
            });
        }
        Ok(Tensor { dim, buf, device })
    }

    /// Shape
    #[must_use]
    pub const fn dim(&self) -> Dim {
        self.dim
    }

    /// Underlying buffer handle
    #[must_use]
    pub const fn buffer(&self) -> &BufferId {
        &self.buf
    }

    /// Owning device
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Batch element `b` as its own view.
    pub fn batch(&self, b: usize) -> Result<Tensor> {
        let size = self.dim.size();
        let buf = self
            .buf
            .sub(b * size, size)
            .ok_or(Error::IndexOutOfBounds {
                index: b,
                len: self.dim.bd(),
            })?;
        Ok(Tensor {
            dim: self.dim.single_batch(),
            buf,
            device: Arc::clone(&self.device),
        })
    }

    /// Copies the values to host memory, waiting for pending kernels.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.device.read(&self.buf)
    }

    /// Value of a single element tensor.
    pub fn as_scalar(&self) -> Result<f32> {
        if self.dim.total() != 1 {
            return Err(Error::ElementCountMismatch {
                dim: self.dim,
                expected: 1,
                got: self.dim.total(),
            });
        }
        Ok(self.to_vec()?[0])
    }

    /// Overwrites the values from host memory.
    pub fn set(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.dim.total() {
            return Err(Error::ElementCountMismatch {
                dim: self.dim,
                expected: self.dim.total(),
                got: data.len(),
            });
        }
        self.device.lock().write(&self.buf, data)
    }

    /// Sets every element to `value`.
    pub fn constant(&self, value: f32) -> Result<()> {
        self.device.lock().fill(&self.buf, value)
    }

    /// Sets every element to 0.
    pub fn zero(&self) -> Result<()> {
        self.constant(0.0)
    }
}
