//! Collector configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::native::Backend;

/// Environment variable enabling the diagnostic summary
pub const ENV_DEBUG: &str = "GPU_TELEMETRY_DEBUG";
/// Environment variable for the CPU sampling window in milliseconds
pub const ENV_CPU_SAMPLE_MS: &str = "GPU_TELEMETRY_CPU_SAMPLE_MS";
/// Environment variable for the process-cache purge cadence
pub const ENV_PURGE_EVERY: &str = "GPU_TELEMETRY_PURGE_EVERY";
/// Environment variable naming the native library to load
pub const ENV_LIBRARY: &str = "GPU_TELEMETRY_LIBRARY";
/// Environment variable selecting the vendor backend
pub const ENV_BACKEND: &str = "GPU_TELEMETRY_BACKEND";

const DEFAULT_CPU_SAMPLE_MS: u64 = 100;
const DEFAULT_PURGE_EVERY: u32 = 1;

/// Settings for a [`Collector`](crate::Collector)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Log the deduplicated diagnostic summary after each poll
    pub debug: bool,
    /// Window between the two CPU reads of a poll
    #[serde(with = "millis")]
    pub cpu_sample_interval: Duration,
    /// Purge exited processes from the cache every N polls; 0 disables
    pub purge_every: u32,
    /// Vendor backend; `None` tries NVML, then AMD SMI
    pub backend: Option<Backend>,
    /// Explicit path of the native library, for the configured backend or
    /// for NVML when none is configured
    pub library_path: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            debug: false,
            cpu_sample_interval: Duration::from_millis(DEFAULT_CPU_SAMPLE_MS),
            purge_every: DEFAULT_PURGE_EVERY,
            backend: None,
            library_path: None,
        }
    }
}

impl CollectorConfig {
    /// Defaults overlaid with the `GPU_TELEMETRY_*` environment
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Overlay values from a key lookup, such as the process environment
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEBUG) {
            self.debug = parse_bool(ENV_DEBUG, &value)?;
        }
        if let Some(value) = lookup(ENV_CPU_SAMPLE_MS) {
            let ms = value.trim().parse::<u64>().map_err(|_| {
                Error::invalid_config(format!("{} must be milliseconds, got {:?}", ENV_CPU_SAMPLE_MS, value))
            })?;
            self.cpu_sample_interval = Duration::from_millis(ms);
        }
        if let Some(value) = lookup(ENV_PURGE_EVERY) {
            self.purge_every = value.trim().parse::<u32>().map_err(|_| {
                Error::invalid_config(format!("{} must be a poll count, got {:?}", ENV_PURGE_EVERY, value))
            })?;
        }
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend = match value.trim().to_ascii_lowercase().as_str() {
                "" | "auto" => None,
                name => Some(name.parse()?),
            };
        }
        if let Some(value) = lookup(ENV_LIBRARY) {
            let value = value.trim();
            if !value.is_empty() {
                self.library_path = Some(PathBuf::from(value));
            }
        }
        Ok(self)
    }

    /// Enable or disable the diagnostic summary
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the CPU sampling window
    pub fn with_cpu_sample_interval(mut self, interval: Duration) -> Self {
        self.cpu_sample_interval = interval;
        self
    }

    /// Set the purge cadence
    pub fn with_purge_every(mut self, polls: u32) -> Self {
        self.purge_every = polls;
        self
    }

    /// Use one vendor backend instead of probing
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Load the native library from `path`
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "{} must be a boolean, got {:?}",
            key, value
        ))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
