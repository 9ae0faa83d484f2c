//! Port to the vendor telemetry library
//!
//! [`NativeLibrary`] mirrors the raw entry points of a vendor library one
//! to one. NVML drives NVIDIA devices and AMD SMI drives AMD devices; both
//! are loaded at runtime. Operations that exist in several incompatible generations take the
//! generation as an argument; an implementation returns
//! [`NativeError::FunctionNotFound`] for a generation the loaded library does
//! not export. Choosing a generation is the job of
//! [`Compat`](crate::compat::Compat), never of call sites.

pub mod amdsmi;
pub(crate) mod loader;
pub mod nvml;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, NativeError, NativeResult};

pub use amdsmi::AmdSmiLibrary;
pub use nvml::NvmlLibrary;

/// Vendor library behind a [`NativeLibrary`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// NVIDIA Management Library
    Nvml,
    /// AMD System Management Interface library
    AmdSmi,
}

impl Backend {
    /// Backends tried when none is configured, in order
    pub const AUTO_ORDER: [Backend; 2] = [Backend::Nvml, Backend::AmdSmi];

    /// Vendor name used in driver messages
    pub fn vendor(&self) -> &'static str {
        match self {
            Backend::Nvml => "NVIDIA",
            Backend::AmdSmi => "ROCM",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Nvml => f.write_str("nvml"),
            Backend::AmdSmi => f.write_str("amdsmi"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvml" | "nvidia" => Ok(Backend::Nvml),
            "amdsmi" | "amd" | "rocm" => Ok(Backend::AmdSmi),
            _ => Err(Error::invalid_config(format!(
                "unknown backend {:?}, expected nvml or amdsmi",
                s
            ))),
        }
    }
}

/// Opaque device token handed out by the native library
///
/// Only meaningful to the library that produced it, and only for the poll in
/// which it was obtained.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    /// Wrap a raw handle value
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub fn as_raw(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle({:#x})", self.0)
    }
}

/// Which of the driver's process lists to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// CUDA/compute contexts
    Compute,
    /// Graphics contexts
    Graphics,
}

impl ProcessKind {
    /// Field name used in diagnostics
    pub fn field(&self) -> &'static str {
        match self {
            ProcessKind::Compute => "compute_processes",
            ProcessKind::Graphics => "graphics_processes",
        }
    }
}

/// Generations of the running-process query, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessApi {
    /// Original entry point, 16-byte records
    V1,
    /// `_v2` entry point, records with GPU instance and compute instance ids
    V2,
    /// `_v3` entry point, same record layout as v2
    V3,
}

impl ProcessApi {
    /// All generations, newest first
    pub const NEWEST_FIRST: [ProcessApi; 3] = [ProcessApi::V3, ProcessApi::V2, ProcessApi::V1];

    /// Symbol suffix of this generation
    pub fn suffix(&self) -> &'static str {
        match self {
            ProcessApi::V1 => "",
            ProcessApi::V2 => "_v2",
            ProcessApi::V3 => "_v3",
        }
    }
}

/// Generations of the memory-info query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryApi {
    /// Legacy record: total, free, used
    V1,
    /// Versioned record: adds reserved memory and corrects `used`
    V2,
}

/// Clock domain for clock queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClockType {
    /// Graphics clock
    Graphics = 0,
    /// Streaming multiprocessor clock
    Sm = 1,
    /// Memory clock
    Memory = 2,
    /// Video encoder/decoder clock
    Video = 3,
}

/// Utilization sample as reported by the native library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawUtilization {
    /// Percent of time a kernel was executing
    pub gpu: u32,
    /// Percent of time device memory was being read or written
    pub memory: u32,
}

/// Encoder/decoder utilization sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCodecUtilization {
    /// Utilization percentage
    pub value: u32,
    /// Sampling period in microseconds
    pub sampling_period_us: u32,
}

/// Memory record normalized across generations, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMemoryInfo {
    /// Installed memory
    pub total: u64,
    /// Memory reserved by the driver (v2 only)
    pub reserved: Option<u64>,
    /// Unallocated memory
    pub free: u64,
    /// Allocated memory
    pub used: u64,
}

/// One entry of a driver process list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawProcessInfo {
    /// Process ID
    pub pid: u32,
    /// GPU memory in bytes; `None` when the driver cannot attribute it
    pub used_gpu_memory: Option<u64>,
}

/// Raw entry points of the vendor telemetry library
///
/// Implementations perform no fallback or error recovery of their own.
pub trait NativeLibrary: Send {
    /// Which vendor library this is
    fn backend(&self) -> Backend;

    /// Initialize the library for this process
    fn init(&self) -> NativeResult<()>;

    /// Release the library's process-wide state
    fn shutdown(&self) -> NativeResult<()>;

    /// Returns true if the loaded library exports `symbol`
    fn has_function(&self, symbol: &str) -> bool;

    /// Version string of the library itself
    fn library_version(&self) -> NativeResult<String>;

    /// Version string of the kernel driver
    fn driver_version(&self) -> NativeResult<String>;

    /// Number of addressable devices
    fn device_count(&self) -> NativeResult<u32>;

    /// Open a device by enumeration index
    fn handle_by_index(&self, index: u32) -> NativeResult<DeviceHandle>;

    /// Enumeration index of a device
    fn index(&self, device: DeviceHandle) -> NativeResult<u32>;

    /// Product name
    fn name(&self, device: DeviceHandle) -> NativeResult<String>;

    /// Vendor UUID
    fn uuid(&self, device: DeviceHandle) -> NativeResult<String>;

    /// Core temperature in degrees Celsius
    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32>;

    /// Fan speed in percent
    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32>;

    /// GPU and memory utilization
    fn utilization_rates(&self, device: DeviceHandle) -> NativeResult<RawUtilization>;

    /// Encoder utilization
    fn encoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization>;

    /// Decoder utilization
    fn decoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization>;

    /// Power draw in milliwatts
    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32>;

    /// Enforced power limit in milliwatts
    fn enforced_power_limit(&self, device: DeviceHandle) -> NativeResult<u32>;

    /// Memory info using the given record generation
    fn memory_info(&self, device: DeviceHandle, api: MemoryApi) -> NativeResult<RawMemoryInfo>;

    /// One of the running-process lists using the given generation
    fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
        api: ProcessApi,
    ) -> NativeResult<Vec<RawProcessInfo>>;

    /// Current clock in MHz
    fn clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32>;

    /// Maximum clock in MHz
    fn max_clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32>;
}

impl<T: NativeLibrary + ?Sized> NativeLibrary for Box<T> {
    fn backend(&self) -> Backend {
        (**self).backend()
    }
    fn init(&self) -> NativeResult<()> {
        (**self).init()
    }
    fn shutdown(&self) -> NativeResult<()> {
        (**self).shutdown()
    }
    fn has_function(&self, symbol: &str) -> bool {
        (**self).has_function(symbol)
    }
    fn library_version(&self) -> NativeResult<String> {
        (**self).library_version()
    }
    fn driver_version(&self) -> NativeResult<String> {
        (**self).driver_version()
    }
    fn device_count(&self) -> NativeResult<u32> {
        (**self).device_count()
    }
    fn handle_by_index(&self, index: u32) -> NativeResult<DeviceHandle> {
        (**self).handle_by_index(index)
    }
    fn index(&self, device: DeviceHandle) -> NativeResult<u32> {
        (**self).index(device)
    }
    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        (**self).name(device)
    }
    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        (**self).uuid(device)
    }
    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        (**self).temperature(device)
    }
    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        (**self).fan_speed(device)
    }
    fn utilization_rates(&self, device: DeviceHandle) -> NativeResult<RawUtilization> {
        (**self).utilization_rates(device)
    }
    fn encoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        (**self).encoder_utilization(device)
    }
    fn decoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        (**self).decoder_utilization(device)
    }
    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        (**self).power_usage(device)
    }
    fn enforced_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        (**self).enforced_power_limit(device)
    }
    fn memory_info(&self, device: DeviceHandle, api: MemoryApi) -> NativeResult<RawMemoryInfo> {
        (**self).memory_info(device, api)
    }
    fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
        api: ProcessApi,
    ) -> NativeResult<Vec<RawProcessInfo>> {
        (**self).running_processes(device, kind, api)
    }
    fn clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        (**self).clock_info(device, clock)
    }
    fn max_clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        (**self).max_clock_info(device, clock)
    }
}

/// Initialized native library, shut down on drop
///
/// Exactly one `init` and one `shutdown` are issued per session.
pub struct NativeSession<N: NativeLibrary> {
    library: N,
}

impl<N: NativeLibrary> NativeSession<N> {
    /// Initialize `library` and take ownership of it
    pub fn open(library: N) -> NativeResult<Self> {
        library.init()?;
        debug!("native telemetry library initialized");
        Ok(Self { library })
    }

    /// The initialized library
    pub fn library(&self) -> &N {
        &self.library
    }
}

impl<N: NativeLibrary> Drop for NativeSession<N> {
    fn drop(&mut self) {
        if let Err(e) = self.library.shutdown() {
            warn!(error = %e, "native telemetry library shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNative;

    #[test]
    fn test_session_init_and_shutdown_once() {
        let native = MockNative::new();
        let counters = native.counters();
        {
            let session = NativeSession::open(native).unwrap();
            assert_eq!(session.library().device_count().unwrap(), 0);
            assert_eq!(counters.init_calls(), 1);
            assert_eq!(counters.shutdown_calls(), 0);
        }
        assert_eq!(counters.shutdown_calls(), 1);
    }

    #[test]
    fn test_session_init_failure() {
        let native = MockNative::new().with_init_error(NativeError::DriverNotLoaded);
        let counters = native.counters();
        let err = NativeSession::open(native).err().unwrap();
        assert_eq!(err, NativeError::DriverNotLoaded);
        assert_eq!(counters.shutdown_calls(), 0);
    }

    #[test]
    fn test_process_api_order() {
        assert_eq!(ProcessApi::NEWEST_FIRST[0], ProcessApi::V3);
        assert!(ProcessApi::V1 < ProcessApi::V3);
        assert_eq!(ProcessApi::V2.suffix(), "_v2");
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("nvml".parse::<Backend>().unwrap(), Backend::Nvml);
        assert_eq!(" ROCm ".parse::<Backend>().unwrap(), Backend::AmdSmi);
        assert_eq!(Backend::AmdSmi.to_string(), "amdsmi");
        assert!("intel".parse::<Backend>().unwrap_err().is_config_error());
    }

    #[test]
    fn test_boxed_library_keeps_backend() {
        let native: Box<dyn NativeLibrary> = Box::new(MockNative::new().with_backend(Backend::AmdSmi));
        assert_eq!(native.backend(), Backend::AmdSmi);
    }
}
