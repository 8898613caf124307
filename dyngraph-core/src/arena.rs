//! Bump allocated memory pools with O(1) checkpoint and revert.
//!
//! Buffers are handed out as arena relative [`BufferId`]s rather than
//! pointers. Freeing memory is resetting the arena offset, which invalidates
//! every handle allocated after the checkpoint. Each handle carries the id of
//! the allocation it came from and the arena keeps the ids of its live
//! allocations, so a stale handle reads an error instead of foreign data even
//! after its range has been handed out again.

use crate::error::{Error, Result};

/// Which of a device's three arenas a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolRole {
    /// Forward values, scoped to one graph.
    Forward,
    /// Gradients, scoped to one graph.
    Backward,
    /// Persistent parameters and device constants.
    Parameters,
}

/// Handle to `len` floats at `offset` in one arena of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub(crate) device: usize,
    pub(crate) pool: PoolRole,
    pub(crate) alloc: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl BufferId {
    /// Number of floats
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for zero sized buffers
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pool this buffer was allocated from
    #[must_use]
    pub const fn pool(&self) -> PoolRole {
        self.pool
    }

    /// Offset in floats from the start of the arena
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Sub range of this buffer. Returns `None` if it does not fit.
    #[must_use]
    pub fn sub(&self, offset: usize, len: usize) -> Option<BufferId> {
        (offset + len <= self.len).then_some(BufferId {
            device: self.device,
            pool: self.pool,
            alloc: self.alloc,
            offset: self.offset + offset,
            len,
        })
    }
}

/// Saved allocation offset of one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    device: usize,
    pool: PoolRole,
    offset: usize,
    live: usize,
}

impl Checkpoint {
    /// Offset recorded by this checkpoint
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Pool this checkpoint was taken from
    #[must_use]
    pub const fn pool(&self) -> PoolRole {
        self.pool
    }
}

/// Fixed capacity bump allocator.
///
/// Capacity is fixed at creation; the backing vector only grows up to the
/// highest offset ever used, so large, mostly idle pools cost nothing.
#[derive(Debug)]
pub struct Arena {
    device: usize,
    device_name: String,
    role: PoolRole,
    capacity: usize,
    align: usize,
    offset: usize,
    next_alloc: u64,
    // ids of live allocations, increasing
    live: Vec<u64>,
    data: Vec<f32>,
}

impl Arena {
    /// Arena holding up to `capacity` floats, with every allocation rounded
    /// up to a multiple of `align` floats.
    #[must_use]
    pub fn new(device: usize, device_name: &str, role: PoolRole, capacity: usize, align: usize) -> Arena {
        Arena {
            device,
            device_name: device_name.into(),
            role,
            capacity,
            align: align.max(1),
            offset: 0,
            next_alloc: 0,
            live: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Role of this arena
    #[must_use]
    pub const fn role(&self) -> PoolRole {
        self.role
    }

    /// Capacity in floats
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current allocation offset in floats
    #[must_use]
    pub const fn used(&self) -> usize {
        self.offset
    }

    /// Bump allocates `len` floats.
    ///
    /// Newly allocated memory is not cleared; it may hold values written
    /// before the last revert.
    pub fn allocate(&mut self, len: usize) -> Result<BufferId> {
        let rounded = len.div_ceil(self.align) * self.align;
        let available = self.capacity - self.offset;
        if rounded > available {
            return Err(Error::ArenaExhausted {
                device: self.device_name.clone(),
                pool: self.role,
                requested: rounded,
                available,
            });
        }
        let buffer = BufferId {
            device: self.device,
            pool: self.role,
            alloc: self.next_alloc,
            offset: self.offset,
            len,
        };
        self.live.push(self.next_alloc);
        self.next_alloc += 1;
        self.offset += rounded;
        if self.data.len() < self.offset {
            self.data.resize(self.offset, 0.0);
        }
        Ok(buffer)
    }

    /// Records the current offset.
    #[must_use]
    pub fn mark(&self) -> Checkpoint {
        Checkpoint {
            device: self.device,
            pool: self.role,
            offset: self.offset,
            live: self.live.len(),
        }
    }

    /// Resets the offset to `checkpoint`. Memory is not scrubbed.
    pub fn revert(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.device != self.device || checkpoint.pool != self.role {
            return Err(Error::CheckpointMismatch {
                reason: format!(
                    "checkpoint of {:?} pool on device {} given to {:?} pool on device {}",
                    checkpoint.pool, checkpoint.device, self.role, self.device
                ),
            });
        }
        if checkpoint.offset > self.offset || checkpoint.live > self.live.len() {
            return Err(Error::CheckpointMismatch {
                reason: format!(
                    "checkpoint offset {} is ahead of {:?} arena offset {}",
                    checkpoint.offset, self.role, self.offset
                ),
            });
        }
        self.offset = checkpoint.offset;
        self.live.truncate(checkpoint.live);
        Ok(())
    }

    fn check(&self, buffer: &BufferId) -> Result<()> {
        if buffer.device != self.device || buffer.pool != self.role {
            return Err(Error::CheckpointMismatch {
                reason: format!(
                    "buffer of {:?} pool on device {} read from {:?} pool on device {}",
                    buffer.pool, buffer.device, self.role, self.device
                ),
            });
        }
        if buffer.offset + buffer.len > self.offset || self.live.binary_search(&buffer.alloc).is_err() {
            return Err(Error::StaleBuffer {
                pool: self.role,
                offset: buffer.offset,
                len: buffer.len,
                end: self.offset,
            });
        }
        Ok(())
    }

    /// Live contents of `buffer`.
    pub fn slice(&self, buffer: &BufferId) -> Result<&[f32]> {
        self.check(buffer)?;
        Ok(&self.data[buffer.offset..buffer.offset + buffer.len])
    }

    /// Live contents of `buffer`, mutably.
    pub fn slice_mut(&mut self, buffer: &BufferId) -> Result<&mut [f32]> {
        self.check(buffer)?;
        Ok(&mut self.data[buffer.offset..buffer.offset + buffer.len])
    }
}
