//! Devices: three arenas, scalar constants and an execution back end.

use crate::arena::{Arena, BufferId, Checkpoint, PoolRole};
use crate::config::{DeviceSpec, MemoryConfig};
use crate::error::{Error, Result};
use crate::exec::{Backend, Executor};
use crate::mutex::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};

static NEXT_DEVICE_ID: AtomicUsize = AtomicUsize::new(0);

/// Hardware class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host processor
    Cpu,
    /// Accelerator card
    Gpu,
}

/// Something that holds pending work against a device's arenas and must
/// flush it before the arenas are snapshotted.
///
/// A computation graph implements this, so devices never name the graph type.
pub trait CheckpointConsumer {
    /// Evaluates everything that is still pending.
    fn materialize(&mut self) -> Result<()>;
}

/// Snapshot of a device's forward and backward arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemCheckpoint {
    pub(crate) device: usize,
    /// Forward arena offset
    pub fxs: Checkpoint,
    /// Backward arena offset
    pub dedfs: Checkpoint,
}

/// Arenas of one device. Held behind the device lock while kernels run.
#[derive(Debug)]
pub struct DeviceMemory {
    fxs: Arena,
    dedfs: Arena,
    ps: Arena,
}

impl DeviceMemory {
    /// Arena for `role`
    #[must_use]
    pub fn arena(&self, role: PoolRole) -> &Arena {
        match role {
            PoolRole::Forward => &self.fxs,
            PoolRole::Backward => &self.dedfs,
            PoolRole::Parameters => &self.ps,
        }
    }

    /// Arena for `role`, mutably
    pub fn arena_mut(&mut self, role: PoolRole) -> &mut Arena {
        match role {
            PoolRole::Forward => &mut self.fxs,
            PoolRole::Backward => &mut self.dedfs,
            PoolRole::Parameters => &mut self.ps,
        }
    }

    /// Allocates `len` floats in the `role` arena.
    pub fn allocate(&mut self, role: PoolRole, len: usize) -> Result<BufferId> {
        self.arena_mut(role).allocate(len)
    }

    /// Allocates `len` floats in the `role` arena and zeroes them.
    pub fn allocate_zeroed(&mut self, role: PoolRole, len: usize) -> Result<BufferId> {
        let buf = self.allocate(role, len)?;
        self.fill(&buf, 0.0)?;
        Ok(buf)
    }

    /// Contents of `buf`
    pub fn slice(&self, buf: &BufferId) -> Result<&[f32]> {
        self.arena(buf.pool).slice(buf)
    }

    /// Contents of `buf`, mutably
    pub fn slice_mut(&mut self, buf: &BufferId) -> Result<&mut [f32]> {
        self.arena_mut(buf.pool).slice_mut(buf)
    }

    /// Overwrites `buf` with `data`.
    pub fn write(&mut self, buf: &BufferId, data: &[f32]) -> Result<()> {
        let dst = self.slice_mut(buf)?;
        if dst.len() != data.len() {
            return Err(Error::IndexOutOfBounds {
                index: data.len(),
                len: dst.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Adds `data` into `buf` elementwise.
    pub fn accumulate(&mut self, buf: &BufferId, data: &[f32]) -> Result<()> {
        let dst = self.slice_mut(buf)?;
        if dst.len() != data.len() {
            return Err(Error::IndexOutOfBounds {
                index: data.len(),
                len: dst.len(),
            });
        }
        dst.iter_mut().zip(data).for_each(|(d, s)| *d += s);
        Ok(())
    }

    /// Sets every element of `buf` to `value`.
    pub fn fill(&mut self, buf: &BufferId, value: f32) -> Result<()> {
        self.slice_mut(buf)?.fill(value);
        Ok(())
    }
}

/// Device-wide scalar constants, allocated in the parameter arena.
#[derive(Debug, Clone, Copy)]
pub struct Constants {
    /// `0`
    pub zero: BufferId,
    /// `1`
    pub one: BufferId,
    /// `-1`
    pub minus_one: BufferId,
}

/// A compute device.
///
/// Devices own three disjoint arenas (forward values, gradients, parameters).
/// Kernels run while holding the memory lock, so taking the lock is also how
/// the host waits for outstanding work ([`Device::synchronize`]).
pub struct Device {
    id: usize,
    name: String,
    kind: DeviceKind,
    backend: Backend,
    #[cfg(feature = "std")]
    pool: Option<rayon::ThreadPool>,
    mem: Mutex<DeviceMemory>,
    constants: Constants,
    claimed: AtomicBool,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl core::fmt::Display for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

impl Device {
    /// Host device executing on the calling thread.
    pub fn cpu(name: &str, memory: &MemoryConfig) -> Result<Arc<Device>> {
        Device::new(name, DeviceKind::Cpu, Backend::Host, memory, 0)
    }

    /// Accelerator device with its own pool of `threads` workers
    /// (0 lets the pool pick one per core).
    pub fn accelerator(name: &str, memory: &MemoryConfig, threads: usize) -> Result<Arc<Device>> {
        Device::new(name, DeviceKind::Gpu, Backend::Accelerator, memory, threads)
    }

    /// Device described by a spec string such as `CPU` or `GPU:0`.
    pub fn from_spec(spec: &DeviceSpec, memory: &MemoryConfig, threads: usize) -> Result<Arc<Device>> {
        match spec {
            DeviceSpec::Cpu => Device::cpu("CPU", memory),
            DeviceSpec::Gpu(ordinal) => Device::accelerator(&format!("GPU:{ordinal}"), memory, threads),
        }
    }

    fn new(
        name: &str,
        kind: DeviceKind,
        backend: Backend,
        memory: &MemoryConfig,
        threads: usize,
    ) -> Result<Arc<Device>> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let floats = |bytes: usize| bytes / core::mem::size_of::<f32>();
        let align = memory.alignment.max(1);
        let mut mem = DeviceMemory {
            fxs: Arena::new(id, name, PoolRole::Forward, floats(memory.forward_bytes), align),
            dedfs: Arena::new(id, name, PoolRole::Backward, floats(memory.backward_bytes), align),
            ps: Arena::new(id, name, PoolRole::Parameters, floats(memory.parameter_bytes), align),
        };
        let mut constant = |value: f32| -> Result<BufferId> {
            let buf = mem.allocate(PoolRole::Parameters, 1)?;
            mem.fill(&buf, value)?;
            Ok(buf)
        };
        let constants = Constants {
            zero: constant(0.0)?,
            one: constant(1.0)?,
            minus_one: constant(-1.0)?,
        };
        #[cfg(feature = "std")]
        let pool = match backend {
            Backend::Host => None,
            Backend::Accelerator => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name({
                        let name = name.to_string();
                        move |i| format!("{name}-worker-{i}")
                    })
                    .build()
                    .map_err(|e| Error::InvalidConfig(format!("{name}: {e}")))?,
            ),
        };
        #[cfg(not(feature = "std"))]
        let _ = threads;
        tracing::info!(
            device = name,
            ?kind,
            ?backend,
            forward = memory.forward_bytes,
            backward = memory.backward_bytes,
            parameters = memory.parameter_bytes,
            "created device"
        );
        Ok(Arc::new(Device {
            id,
            name: name.into(),
            kind,
            backend,
            #[cfg(feature = "std")]
            pool,
            mem: Mutex::new(mem),
            constants,
            claimed: AtomicBool::new(false),
        }))
    }

    /// Process unique id
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hardware class
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Capability token for the execution path
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Scalar constants 0, 1 and -1
    #[must_use]
    pub const fn constants(&self) -> &Constants {
        &self.constants
    }

    /// Kernel launcher for this device.
    #[must_use]
    pub fn executor(&self) -> Executor<'_> {
        match self.backend {
            Backend::Host => Executor::host(),
            #[cfg(feature = "std")]
            Backend::Accelerator => Executor::accelerator(self.pool.as_ref()),
            #[cfg(not(feature = "std"))]
            Backend::Accelerator => Executor::host(),
        }
    }

    /// Locks the device memory. Kernels run under this lock.
    pub fn lock(&self) -> MutexGuard<'_, DeviceMemory> {
        self.mem.lock()
    }

    /// Waits until no kernel is running against this device.
    pub fn synchronize(&self) {
        drop(self.mem.lock());
    }

    /// Snapshots the forward and backward arenas.
    ///
    /// A consumer is given the chance to flush pending work first, so that
    /// the snapshot covers its values.
    pub fn mark(&self, consumer: Option<&mut dyn CheckpointConsumer>) -> Result<DeviceMemCheckpoint> {
        if let Some(consumer) = consumer {
            consumer.materialize()?;
        }
        let mem = self.mem.lock();
        Ok(DeviceMemCheckpoint {
            device: self.id,
            fxs: mem.fxs.mark(),
            dedfs: mem.dedfs.mark(),
        })
    }

    /// Reverts the forward and backward arenas to `checkpoint`.
    ///
    /// Waits for in-flight kernels before resetting offsets.
    pub fn revert(&self, checkpoint: &DeviceMemCheckpoint) -> Result<()> {
        if checkpoint.device != self.id {
            return Err(Error::CheckpointMismatch {
                reason: format!("checkpoint of device {} given to {}", checkpoint.device, self.name),
            });
        }
        self.synchronize();
        let mut mem = self.mem.lock();
        mem.fxs.revert(checkpoint.fxs)?;
        mem.dedfs.revert(checkpoint.dedfs)
    }

    /// Reverts only the arena `checkpoint` was taken from. The parameter
    /// arena can not be reverted.
    pub fn revert_pool(&self, checkpoint: Checkpoint) -> Result<()> {
        self.synchronize();
        if checkpoint.pool() == PoolRole::Parameters {
            return Err(Error::CheckpointMismatch {
                reason: format!("parameter arena of {} is never reverted", self.name),
            });
        }
        self.mem.lock().arena_mut(checkpoint.pool()).revert(checkpoint)
    }

    /// Marks the device as used by a live graph.
    pub fn claim(self: &Arc<Self>) -> Result<DeviceClaim> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::DeviceBusy {
                device: self.name.clone(),
            });
        }
        Ok(DeviceClaim {
            device: Arc::clone(self),
        })
    }

    /// True while a live graph uses this device
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Copies `buf` to host memory.
    pub fn read(&self, buf: &BufferId) -> Result<Vec<f32>> {
        self.check_buffer(buf)?;
        Ok(self.mem.lock().slice(buf)?.to_vec())
    }

    /// Errors with [`Error::DeviceMismatch`] if `buf` is not from this device.
    pub fn check_buffer(&self, buf: &BufferId) -> Result<()> {
        if buf.device != self.id {
            return Err(Error::DeviceMismatch {
                op: "buffer access",
                expected: self.name.clone(),
                found: format!("device #{}", buf.device),
            });
        }
        Ok(())
    }
}

/// Exclusive use of a device by one live graph. Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    device: Arc<Device>,
}

impl DeviceClaim {
    /// Claimed device
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.device.claimed.store(false, Ordering::Release);
    }
}
