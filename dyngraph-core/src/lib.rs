//! # dyngraph-core
//!
//! dyngraph-core is the memory and execution layer of dyngraph. It contains
//! batched dims, fixed size arenas with checkpoint and revert, devices with
//! host and accelerator back ends, tensor views and parameter initializers,
//! and the process configuration and device registry.
//!
#![forbid(unsafe_code)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

/// See [Arena](arena::Arena)
pub mod arena;
/// See [Config](config::Config)
pub mod config;
/// See [Device](device::Device)
pub mod device;
/// See [Dim](dim::Dim)
pub mod dim;
/// See [Error](error::Error)
pub mod error;
/// See [Executor](exec::Executor)
pub mod exec;
pub mod init;
pub mod mutex;
pub mod rng;
/// See [Tensor](tensor::Tensor)
pub mod tensor;

mod registry;

pub use arena::{BufferId, Checkpoint, PoolRole};
pub use config::{Config, DeviceSpec, MemoryConfig};
pub use device::{CheckpointConsumer, Device, DeviceClaim, DeviceKind, DeviceMemCheckpoint, DeviceMemory};
pub use dim::Dim;
pub use error::{Error, Result};
pub use exec::{Backend, Executor, Mat};
pub use registry::{default_autobatch, default_device, device_by_name, devices, initialize};
pub use tensor::Tensor;
