//! Data types for GPU telemetry snapshots
//!
//! Every metric that the native layer may fail to report is an `Option`;
//! `None` is the only representation of "unavailable" and is never folded
//! into a default value such as zero.

use std::fmt;
use std::slice;

use chrono::{DateTime, Local};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::compat::Advisory;
use crate::error::NativeError;
use crate::probe::Diagnostics;

/// Memory size in mebibytes
pub type Megabytes = u64;
/// Temperature in degrees Celsius
pub type Celsius = u32;
/// Percentage in the range 0..=100 (fan speed may exceed 100 on some boards)
pub type Percentage = u32;
/// Power in Watts
pub type Watts = u32;
/// Clock frequency in MHz
pub type Megahertz = u32;

/// Device-level metrics gathered for one GPU in one poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceMetrics {
    /// Core temperature
    #[serde(rename = "temperature.gpu")]
    pub temperature: Option<Celsius>,
    /// Fan speed as a percentage of its maximum
    #[serde(rename = "fan.speed")]
    pub fan_speed: Option<Percentage>,
    /// Graphics/compute utilization
    #[serde(rename = "utilization.gpu")]
    pub utilization: Option<Percentage>,
    /// Video encoder utilization
    #[serde(rename = "utilization.enc")]
    pub utilization_enc: Option<Percentage>,
    /// Video decoder utilization
    #[serde(rename = "utilization.dec")]
    pub utilization_dec: Option<Percentage>,
    /// Current board power draw
    #[serde(rename = "power.draw")]
    pub power_draw: Option<Watts>,
    /// Power limit enforced by the driver
    #[serde(rename = "enforced.power.limit")]
    pub power_limit: Option<Watts>,
    /// Memory in use
    #[serde(rename = "memory.used")]
    pub memory_used: Option<Megabytes>,
    /// Installed memory
    #[serde(rename = "memory.total")]
    pub memory_total: Option<Megabytes>,
    /// Current graphics clock
    #[serde(rename = "clocks.current")]
    pub clock: Option<Megahertz>,
    /// Maximum graphics clock
    #[serde(rename = "clocks.max")]
    pub clock_max: Option<Megahertz>,
}

impl DeviceMetrics {
    /// Returns the free memory, clamped at zero
    pub fn memory_free(&self) -> Option<Megabytes> {
        Some(self.memory_total?.saturating_sub(self.memory_used?))
    }

    /// Alias for [`memory_free`](Self::memory_free)
    pub fn memory_available(&self) -> Option<Megabytes> {
        self.memory_free()
    }

    /// Returns the power draw as a percentage of the enforced limit
    pub fn power_ratio(&self) -> Option<f64> {
        let limit = self.power_limit?;
        if limit == 0 {
            return None;
        }
        Some(self.power_draw? as f64 / limit as f64 * 100.0)
    }
}

/// One process using a GPU, enriched with OS-level metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    /// Process ID
    pub pid: u32,
    /// GPU memory attributed to the process by the driver
    pub gpu_memory_usage: Option<Megabytes>,
    /// Owner of the process
    pub username: Option<String>,
    /// Short command name (basename of argv[0])
    pub command: Option<String>,
    /// Full argument vector
    pub full_command: Option<Vec<String>>,
    /// CPU usage over the poll's sampling window
    pub cpu_percent: Option<f64>,
    /// Resident host memory in bytes
    pub cpu_memory_usage: Option<u64>,
}

impl ProcessRecord {
    /// Create a record carrying only the driver-supplied fields
    pub fn new(pid: u32, gpu_memory_usage: Option<Megabytes>) -> Self {
        Self {
            pid,
            gpu_memory_usage,
            username: None,
            command: None,
            full_command: None,
            cpu_percent: None,
            cpu_memory_usage: None,
        }
    }

    /// Returns true if none of the OS-derived fields could be read
    pub fn is_os_unavailable(&self) -> bool {
        self.username.is_none()
            && self.command.is_none()
            && self.full_command.is_none()
            && self.cpu_percent.is_none()
            && self.cpu_memory_usage.is_none()
    }
}

/// A GPU whose handle opened and whose identity could be read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStat {
    /// Enumeration index
    pub index: u32,
    /// Vendor-assigned identity, stable across polls
    pub uuid: String,
    /// Product name
    pub name: String,
    /// Device-level metrics
    #[serde(flatten)]
    pub metrics: DeviceMetrics,
    /// Running processes; `None` when neither process list could be read
    pub processes: Option<Vec<ProcessRecord>>,
}

/// Why a device could not be queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The device fell off the bus
    DeviceLost,
    /// The native layer reported an unknown error
    UnknownError,
    /// Any other native failure
    Other,
}

impl FailureClass {
    /// Classify the native error that made a device unavailable
    pub fn from_error(error: &NativeError) -> Self {
        match error {
            NativeError::GpuIsLost => FailureClass::DeviceLost,
            NativeError::Unknown => FailureClass::UnknownError,
            _ => FailureClass::Other,
        }
    }

    /// Placeholder text shown in place of the device name
    pub fn message(&self) -> &'static str {
        match self {
            FailureClass::DeviceLost => "((GPU is lost))",
            FailureClass::UnknownError | FailureClass::Other => "((Unknown Error))",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Placeholder for a device that could not be queried in this poll
#[derive(Debug, Clone, PartialEq)]
pub struct UnavailableDevice {
    /// Enumeration index
    pub index: u32,
    /// Failure class
    pub failure: FailureClass,
    /// The native error that caused the failure
    pub error: NativeError,
}

impl Serialize for UnavailableDevice {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UnavailableDevice", 5)?;
        state.serialize_field("index", &self.index)?;
        state.serialize_field("name", self.failure.message())?;
        state.serialize_field("failure", &self.failure)?;
        state.serialize_field("error", &self.error.to_string())?;
        state.serialize_field("processes", &Option::<()>::None)?;
        state.end()
    }
}

/// Per-device result of one poll
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceSnapshot {
    /// The device was queried
    Available(GpuStat),
    /// The device could not be queried
    Unavailable(UnavailableDevice),
}

impl DeviceSnapshot {
    /// Enumeration index, present for both variants
    pub fn index(&self) -> u32 {
        match self {
            DeviceSnapshot::Available(gpu) => gpu.index,
            DeviceSnapshot::Unavailable(dev) => dev.index,
        }
    }

    /// Returns true for the `Available` variant
    pub fn is_available(&self) -> bool {
        matches!(self, DeviceSnapshot::Available(_))
    }

    /// Borrow the populated device, if any
    pub fn as_available(&self) -> Option<&GpuStat> {
        match self {
            DeviceSnapshot::Available(gpu) => Some(gpu),
            DeviceSnapshot::Unavailable(_) => None,
        }
    }

    /// Display name: the product name or the failure placeholder
    pub fn name(&self) -> &str {
        match self {
            DeviceSnapshot::Available(gpu) => &gpu.name,
            DeviceSnapshot::Unavailable(dev) => dev.failure.message(),
        }
    }
}

/// Result of one poll across all requested devices
///
/// A collection is immutable once built; renderers only read it.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    hostname: String,
    driver_version: Option<String>,
    query_time: DateTime<Local>,
    gpus: Vec<DeviceSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    advisories: Vec<Advisory>,
    #[serde(skip)]
    diagnostics: Diagnostics,
}

impl Collection {
    pub(crate) fn new(
        hostname: String,
        driver_version: Option<String>,
        query_time: DateTime<Local>,
        gpus: Vec<DeviceSnapshot>,
        advisories: Vec<Advisory>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            hostname,
            driver_version,
            query_time,
            gpus,
            advisories,
            diagnostics,
        }
    }

    /// Host the collection was taken on
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Driver version, or `None` if it could not be read
    pub fn driver_version(&self) -> Option<&str> {
        self.driver_version.as_deref()
    }

    /// Capture time
    pub fn query_time(&self) -> DateTime<Local> {
        self.query_time
    }

    /// All device snapshots in enumeration order
    pub fn gpus(&self) -> &[DeviceSnapshot] {
        &self.gpus
    }

    /// Driver/library compatibility advisories
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    /// Per-field failures recorded during the poll
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Number of device entries
    pub fn len(&self) -> usize {
        self.gpus.len()
    }

    /// Returns true if no device was enumerated
    pub fn is_empty(&self) -> bool {
        self.gpus.is_empty()
    }

    /// Device snapshot at a position in the collection
    pub fn get(&self, position: usize) -> Option<&DeviceSnapshot> {
        self.gpus.get(position)
    }

    /// Iterate over all device snapshots
    pub fn iter(&self) -> slice::Iter<'_, DeviceSnapshot> {
        self.gpus.iter()
    }

    /// Iterate over the devices that could be queried
    pub fn available(&self) -> impl Iterator<Item = &GpuStat> {
        self.gpus.iter().filter_map(DeviceSnapshot::as_available)
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a DeviceSnapshot;
    type IntoIter = slice::Iter<'a, DeviceSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.gpus.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_free_clamps() {
        let metrics = DeviceMetrics {
            memory_used: Some(9000),
            memory_total: Some(8000),
            ..Default::default()
        };
        assert_eq!(metrics.memory_free(), Some(0));

        let metrics = DeviceMetrics {
            memory_used: None,
            memory_total: Some(8000),
            ..Default::default()
        };
        assert_eq!(metrics.memory_available(), None);
    }

    #[test]
    fn test_power_ratio() {
        let metrics = DeviceMetrics {
            power_draw: Some(125),
            power_limit: Some(250),
            ..Default::default()
        };
        assert_eq!(metrics.power_ratio(), Some(50.0));
    }

    #[test]
    fn test_failure_class() {
        assert_eq!(
            FailureClass::from_error(&NativeError::GpuIsLost),
            FailureClass::DeviceLost
        );
        assert_eq!(
            FailureClass::from_error(&NativeError::Unknown),
            FailureClass::UnknownError
        );
        assert_eq!(FailureClass::DeviceLost.to_string(), "((GPU is lost))");
    }

    #[test]
    fn test_snapshot_index() {
        let snapshot = DeviceSnapshot::Unavailable(UnavailableDevice {
            index: 3,
            failure: FailureClass::DeviceLost,
            error: NativeError::GpuIsLost,
        });
        assert_eq!(snapshot.index(), 3);
        assert!(!snapshot.is_available());
        assert_eq!(snapshot.name(), "((GPU is lost))");
    }

    #[test]
    fn test_unavailable_metric_serializes_as_null() {
        let metrics = DeviceMetrics {
            temperature: Some(0),
            ..Default::default()
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["temperature.gpu"], 0);
        assert!(json["utilization.gpu"].is_null());
    }
}
