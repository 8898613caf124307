use crate::arena::PoolRole;
use crate::dim::Dim;

/// Result alias used across dyngraph.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by graph construction, evaluation and parameter storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Argument dims rejected by an operation's shape rule.
    #[error("DimensionMismatch in {op}: incompatible argument dims {}", fmt_dims(.dims))]
    DimensionMismatch {
        /// Operation name
        op: &'static str,
        /// Dims of every argument, in argument order
        dims: Vec<Dim>,
    },
    /// Arguments live on different devices and no transfer node was used.
    #[error("DeviceMismatch in {op}: expected device {expected}, found {found}")]
    DeviceMismatch {
        /// Operation name
        op: &'static str,
        /// Device the node is placed on
        expected: String,
        /// Device of the offending argument
        found: String,
    },
    /// A fixed size arena ran out of space.
    #[error("ArenaExhausted: {pool:?} pool of {device} needs {requested} floats, {available} left")]
    ArenaExhausted {
        /// Device name
        device: String,
        /// Which of the three pools
        pool: PoolRole,
        /// Floats requested (after alignment)
        requested: usize,
        /// Floats still free
        available: usize,
    },
    /// Backward was requested from a node that is not a scalar.
    #[error("InvalidBackwardTarget: node {index} has dim {dim}, backward needs size 1")]
    InvalidBackwardTarget {
        /// Node index
        index: usize,
        /// Its dim
        dim: Dim,
    },
    /// A node was read before forward evaluation reached it.
    #[error("NotEvaluated: node {index} has no value yet")]
    NotEvaluated {
        /// Node index
        index: usize,
    },
    /// A node referenced an argument that is not strictly before it.
    #[error("InvalidNodeIndex: {index} is not below {len}")]
    InvalidNodeIndex {
        /// Referenced index
        index: usize,
        /// Index of the node being added
        len: usize,
    },
    /// Index out of bounds (lookup rows, picked elements, parameter handles).
    #[error("IndexOutOfBounds: the index is {index}, but the len is {len}")]
    IndexOutOfBounds {
        /// Passed index
        index: usize,
        /// Actual length
        len: usize,
    },
    /// Host data does not match the element count of a dim.
    #[error("ElementCountMismatch: dim {dim} holds {expected} floats, got {got}")]
    ElementCountMismatch {
        /// Target dim
        dim: Dim,
        /// Floats the dim holds
        expected: usize,
        /// Floats passed in
        got: usize,
    },
    /// Checkpoint taken from another arena, or ahead of the current offset.
    #[error("CheckpointMismatch: {reason}")]
    CheckpointMismatch {
        /// What did not match
        reason: String,
    },
    /// A buffer handle that points past the live part of its arena.
    #[error("StaleBuffer: {pool:?} buffer at offset {offset} + {len} was released (arena end {end})")]
    StaleBuffer {
        /// Pool of the buffer
        pool: PoolRole,
        /// Buffer offset
        offset: usize,
        /// Buffer length
        len: usize,
        /// Current arena offset
        end: usize,
    },
    /// Another live graph already uses this device.
    #[error("DeviceBusy: {device} is already used by a live computation graph")]
    DeviceBusy {
        /// Device name
        device: String,
    },
    /// Device description or configuration value that can not be used.
    #[error("InvalidConfig: {0}")]
    InvalidConfig(String),
    /// IO failure while reading configuration.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn fmt_dims(dims: &[Dim]) -> String {
    dims.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Shorthand for [`Error::DimensionMismatch`].
    pub fn dimension_mismatch(op: &'static str, dims: impl IntoIterator<Item = Dim>) -> Error {
        Error::DimensionMismatch {
            op,
            dims: dims.into_iter().collect(),
        }
    }
}
