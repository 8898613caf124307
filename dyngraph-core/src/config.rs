//! Process configuration.
//!
//! Resolution order: built-in defaults, then `dyngraph/config.json` from the
//! XDG config directories, then `DYNGRAPH_*` environment variables.

use crate::error::{Error, Result};
use nanoserde::DeJson;

const MB: usize = 1 << 20;

/// Arena sizes of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Forward value arena, bytes
    pub forward_bytes: usize,
    /// Gradient arena, bytes
    pub backward_bytes: usize,
    /// Parameter arena, bytes
    pub parameter_bytes: usize,
    /// Allocation granularity, floats
    pub alignment: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            forward_bytes: 128 * MB,
            backward_bytes: 128 * MB,
            parameter_bytes: 128 * MB,
            alignment: 8,
        }
    }
}

impl MemoryConfig {
    /// Same size for all three arenas, given in floats. Handy for tests.
    #[must_use]
    pub fn floats(n: usize) -> MemoryConfig {
        let bytes = n * core::mem::size_of::<f32>();
        MemoryConfig {
            forward_bytes: bytes,
            backward_bytes: bytes,
            parameter_bytes: bytes,
            alignment: 1,
        }
    }

    /// Parses `"F,B,P"` megabytes, or a single total split evenly.
    pub fn parse_megabytes(s: &str) -> Result<MemoryConfig> {
        let parts = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .map_err(|e| Error::InvalidConfig(format!("memory size {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let (f, b, p) = match parts.as_slice() {
            [total] => (total / 3, total / 3, total - 2 * (total / 3)),
            [f, b, p] => (*f, *b, *p),
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "memory must be \"TOTAL\" or \"F,B,P\" megabytes, got {s:?}"
                )))
            }
        };
        Ok(MemoryConfig {
            forward_bytes: f * MB,
            backward_bytes: b * MB,
            parameter_bytes: p * MB,
            ..MemoryConfig::default()
        })
    }
}

/// Device entry in the device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    /// `CPU`
    Cpu,
    /// `GPU:n`
    Gpu(usize),
}

impl core::str::FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(DeviceSpec::Cpu);
        }
        let upper = s.to_ascii_uppercase();
        if upper == "GPU" {
            return Ok(DeviceSpec::Gpu(0));
        }
        if let Some(ordinal) = upper.strip_prefix("GPU:") {
            return ordinal
                .parse()
                .map(DeviceSpec::Gpu)
                .map_err(|e| Error::InvalidConfig(format!("device {s:?}: {e}")));
        }
        Err(Error::InvalidConfig(format!(
            "unknown device {s:?}, expected CPU or GPU:n"
        )))
    }
}

/// Everything the process wide registry needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Arena sizes, per device
    pub memory: MemoryConfig,
    /// Devices to create; the first one is the default device
    pub devices: Vec<DeviceSpec>,
    /// Worker threads of accelerator devices, 0 for one per core
    pub threads: usize,
    /// Seed of the parameter initialization RNG
    pub seed: u64,
    /// Whether new graphs autobatch by default
    pub autobatch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            memory: MemoryConfig::default(),
            devices: vec![DeviceSpec::Cpu],
            threads: 0,
            seed: 42,
            autobatch: false,
        }
    }
}

#[derive(Debug, Default, DeJson)]
struct ConfigFile {
    #[nserde(default)]
    forward_mb: Option<usize>,
    #[nserde(default)]
    backward_mb: Option<usize>,
    #[nserde(default)]
    parameters_mb: Option<usize>,
    #[nserde(default)]
    alignment: Option<usize>,
    #[nserde(default)]
    devices: Option<Vec<String>>,
    #[nserde(default)]
    threads: Option<usize>,
    #[nserde(default)]
    seed: Option<u64>,
    #[nserde(default)]
    autobatch: Option<bool>,
}

impl Config {
    /// Defaults, overridden by the XDG config file, overridden by the environment.
    pub fn load() -> Result<Config> {
        let mut config = Config::default();
        if let Some(file) = find_config_file() {
            match config.apply_json(&file) {
                Ok(()) => tracing::debug!("config.json successfully read and parsed"),
                Err(e) => tracing::warn!("failed to parse config.json, using defaults: {e}"),
            }
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides fields present in a JSON document.
    pub fn apply_json(&mut self, json: &str) -> Result<()> {
        let file = ConfigFile::deserialize_json(json)
            .map_err(|e| Error::InvalidConfig(format!("config.json: {e:?}")))?;
        let mb = |v: usize| v * MB;
        if let Some(v) = file.forward_mb {
            self.memory.forward_bytes = mb(v);
        }
        if let Some(v) = file.backward_mb {
            self.memory.backward_bytes = mb(v);
        }
        if let Some(v) = file.parameters_mb {
            self.memory.parameter_bytes = mb(v);
        }
        if let Some(v) = file.alignment {
            self.memory.alignment = v;
        }
        if let Some(devices) = file.devices {
            self.devices = devices.iter().map(|d| d.parse()).collect::<Result<_>>()?;
        }
        if let Some(v) = file.threads {
            self.threads = v;
        }
        if let Some(v) = file.seed {
            self.seed = v;
        }
        if let Some(v) = file.autobatch {
            self.autobatch = v;
        }
        Ok(())
    }

    /// Overrides fields from `DYNGRAPH_*` variables, read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("DYNGRAPH_MEM") {
            let alignment = self.memory.alignment;
            self.memory = MemoryConfig {
                alignment,
                ..MemoryConfig::parse_megabytes(&v)?
            };
        }
        if let Some(v) = var("DYNGRAPH_DEVICES") {
            self.devices = v
                .split(',')
                .filter(|d| !d.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_>>()?;
        }
        if let Some(v) = var("DYNGRAPH_THREADS") {
            self.threads = parse_var("DYNGRAPH_THREADS", &v)?;
        }
        if let Some(v) = var("DYNGRAPH_SEED") {
            self.seed = parse_var("DYNGRAPH_SEED", &v)?;
        }
        if let Some(v) = var("DYNGRAPH_AUTOBATCH") {
            self.autobatch = parse_var::<u8>("DYNGRAPH_AUTOBATCH", &v)? != 0;
        }
        if self.devices.is_empty() {
            return Err(Error::InvalidConfig("device list is empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T: core::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: core::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{key}={value:?}: {e}")))
}

// Search through config directories and find dyngraph/config.json.
// If not found, use defaults.
#[cfg(feature = "std")]
fn find_config_file() -> Option<String> {
    xdg::BaseDirectories::new()
        .map_err(|e| tracing::debug!("failed to find config directories: {e}"))
        .ok()
        .map(|bd| {
            let mut dirs = bd.get_config_dirs();
            dirs.push(bd.get_config_home());
            dirs
        })
        .and_then(|paths| {
            paths.into_iter().find_map(|mut path| {
                path.push("dyngraph/config.json");
                std::fs::read_to_string(&path).ok()
            })
        })
}

#[cfg(not(feature = "std"))]
fn find_config_file() -> Option<String> {
    None
}
