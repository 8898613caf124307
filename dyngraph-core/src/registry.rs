//! Process wide device registry.
//!
//! Only the outermost API layer reaches for these; graph and model internals
//! always work with the device they were given.

use crate::config::Config;
use crate::device::Device;
use crate::error::{Error, Result};
use std::sync::{Arc, OnceLock};

struct Registry {
    devices: Vec<Arc<Device>>,
    autobatch: bool,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn build(config: &Config) -> Result<Registry> {
    crate::rng::seed(config.seed);
    let devices = config
        .devices
        .iter()
        .map(|spec| Device::from_spec(spec, &config.memory, config.threads))
        .collect::<Result<Vec<_>>>()?;
    if devices.is_empty() {
        return Err(Error::InvalidConfig("device list is empty".into()));
    }
    tracing::info!(
        devices = ?devices.iter().map(|d| d.name()).collect::<Vec<_>>(),
        seed = config.seed,
        "initialized device registry"
    );
    Ok(Registry {
        devices,
        autobatch: config.autobatch,
    })
}

/// Creates the process wide devices. Fails if they already exist.
pub fn initialize(config: &Config) -> Result<()> {
    if REGISTRY.get().is_some() {
        return Err(Error::InvalidConfig("devices are already initialized".into()));
    }
    REGISTRY
        .set(build(config)?)
        .map_err(|_| Error::InvalidConfig("devices are already initialized".into()))
}

fn registry() -> Result<&'static Registry> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }
    let registry = build(&Config::load()?)?;
    if REGISTRY.set(registry).is_err() {
        tracing::debug!("device registry was initialized concurrently");
    }
    REGISTRY
        .get()
        .ok_or_else(|| Error::InvalidConfig("device registry is unavailable".into()))
}

/// First configured device, initializing from [`Config::load`] on first use.
pub fn default_device() -> Result<Arc<Device>> {
    registry().map(|r| Arc::clone(&r.devices[0]))
}

/// Registered device called `name`, e.g. `CPU` or `GPU:0`.
pub fn device_by_name(name: &str) -> Result<Arc<Device>> {
    registry()?
        .devices
        .iter()
        .find(|d| d.name().eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| Error::InvalidConfig(format!("no device named {name:?}")))
}

/// All registered devices
pub fn devices() -> Result<Vec<Arc<Device>>> {
    Ok(registry()?.devices.clone())
}

/// Whether new graphs autobatch by default
pub fn default_autobatch() -> Result<bool> {
    registry().map(|r| r.autobatch)
}
