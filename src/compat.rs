//! Compatibility layer over evolving native library generations
//!
//! NVML has changed several entry points in incompatible ways:
//!
//! - The running-process queries exist as `nvmlDevice*RunningProcesses`,
//!   `..._v2` and `..._v3`. Drivers before 510.39 lack v3, drivers before
//!   450 lack v2.
//! - `nvmlDeviceGetMemoryInfo_v2` (driver >= 515) takes a versioned record
//!   and reports `used` without the driver-reserved region. The legacy call
//!   still succeeds on those drivers but its `used` is wrong, so the
//!   versioned form must be preferred whenever it exists.
//!
//! [`Compat`] resolves each such operation once, on first use, to the newest
//! generation the loaded library exports, and caches the choice for the
//! lifetime of the session. It also recognizes driver releases with known
//! defects, and AMD drivers older than the oldest tested release.

use std::cell::{OnceCell, RefCell};
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{NativeError, NativeResult};
use crate::native::{
    Backend, DeviceHandle, MemoryApi, NativeLibrary, NativeSession, ProcessApi, ProcessKind,
    RawMemoryInfo, RawProcessInfo,
};

/// Symbol whose presence means the library can produce correct memory usage
const MEMORY_V2_SYMBOL: &str = "nvmlDeviceGetMemoryInfo_v2";

/// First driver release that reports memory through the versioned record
const MEMORY_V2_DRIVER: &[u32] = &[515, 39];

/// Oldest AMD driver release checked against
const TESTED_AMD_DRIVER: &[u32] = &[6, 7, 8];

/// A driver release range with a known defect
struct KnownIssue {
    /// First affected version (inclusive)
    from: &'static [u32],
    /// First fixed version (exclusive)
    until: &'static [u32],
    kind: AdvisoryKind,
    message: &'static str,
}

const KNOWN_DRIVER_ISSUES: &[KnownIssue] = &[KnownIssue {
    from: &[535, 43],
    until: &[535, 86],
    kind: AdvisoryKind::IncompatibleDriver,
    message: "process information will be inaccurate. \
              Upgrade the NVIDIA driver to 535.104.05 or higher",
}];

/// Outcome of resolving a versioned operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<G> {
    /// The newest generation the library exports
    Resolved(G),
    /// No known generation is exported
    Unresolved,
}

/// Category of a compatibility advisory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    /// The driver release is known to report wrong data
    IncompatibleDriver,
    /// The loaded library is older than the driver it talks to
    LibrarySkew,
    /// The driver predates every release checked against
    UntestedDriver,
}

/// Non-fatal notice about a driver/library combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Advisory {
    /// Category
    pub kind: AdvisoryKind,
    /// Human-readable description
    pub message: String,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Parse a dot-separated version; non-numeric segments count as 0
pub fn parse_version(version: &str) -> Vec<u32> {
    version
        .trim()
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0))
        .collect()
}

/// Check a driver version against known defects
///
/// `library_has_memory_v2` reports whether the loaded library exports the
/// versioned memory query.
pub fn check_driver_version(driver_version: &str, library_has_memory_v2: bool) -> Vec<Advisory> {
    let version = parse_version(driver_version);
    let mut advisories = Vec::new();

    for issue in KNOWN_DRIVER_ISSUES {
        if version.as_slice() >= issue.from && version.as_slice() < issue.until {
            advisories.push(Advisory {
                kind: issue.kind,
                message: format!(
                    "This version of NVIDIA Driver {} is incompatible, {}.",
                    driver_version, issue.message
                ),
            });
        }
    }

    if version.as_slice() >= MEMORY_V2_DRIVER && !library_has_memory_v2 {
        advisories.push(Advisory {
            kind: AdvisoryKind::LibrarySkew,
            message: format!(
                "NVIDIA Driver {} requires {} to report correct memory usage, \
                 but the loaded library does not export it; memory usage will include reserved memory.",
                driver_version, MEMORY_V2_SYMBOL
            ),
        });
    }

    advisories
}

/// Check an AMD driver version against the oldest tested release
pub fn check_amd_driver_version(driver_version: &str) -> Vec<Advisory> {
    if parse_version(driver_version).as_slice() >= TESTED_AMD_DRIVER {
        return Vec::new();
    }
    vec![Advisory {
        kind: AdvisoryKind::UntestedDriver,
        message: format!(
            "This version of {} Driver {} is untested.",
            Backend::AmdSmi.vendor(),
            driver_version
        ),
    }]
}

/// Version-negotiating front end to a native library session
///
/// Not `Sync`: resolutions are cached without locking, so a `Compat` belongs
/// to one collection path at a time.
pub struct Compat<N: NativeLibrary> {
    session: NativeSession<N>,
    compute_api: OnceCell<Resolution<ProcessApi>>,
    graphics_api: OnceCell<Resolution<ProcessApi>>,
    memory_api: OnceCell<MemoryApi>,
    warned_driver: RefCell<Option<String>>,
}

impl<N: NativeLibrary> Compat<N> {
    /// Initialize `library` and wrap it
    pub fn open(library: N) -> NativeResult<Self> {
        Ok(Self {
            session: NativeSession::open(library)?,
            compute_api: OnceCell::new(),
            graphics_api: OnceCell::new(),
            memory_api: OnceCell::new(),
            warned_driver: RefCell::new(None),
        })
    }

    /// The underlying library, for operations with a single generation
    pub fn library(&self) -> &N {
        self.session.library()
    }

    /// Resolved generation of a process-list query, if already resolved
    pub fn process_api(&self, kind: ProcessKind) -> Option<Resolution<ProcessApi>> {
        self.process_cell(kind).get().copied()
    }

    /// Resolved memory-info generation, if already resolved
    pub fn memory_api(&self) -> Option<MemoryApi> {
        self.memory_api.get().copied()
    }

    fn process_cell(&self, kind: ProcessKind) -> &OnceCell<Resolution<ProcessApi>> {
        match kind {
            ProcessKind::Compute => &self.compute_api,
            ProcessKind::Graphics => &self.graphics_api,
        }
    }

    /// Read one of a device's process lists through the newest available
    /// generation
    ///
    /// The first call walks the generations newest first, stepping down only
    /// on [`NativeError::FunctionNotFound`]. Any other outcome, success or
    /// not, fixes the generation. If none resolves, every later call fails
    /// with `FunctionNotFound` without touching the library.
    pub fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
    ) -> NativeResult<Vec<RawProcessInfo>> {
        let cell = self.process_cell(kind);
        match cell.get() {
            Some(Resolution::Resolved(api)) => {
                return self.library().running_processes(device, kind, *api)
            }
            Some(Resolution::Unresolved) => return Err(NativeError::FunctionNotFound),
            None => {}
        }

        for api in ProcessApi::NEWEST_FIRST {
            match self.library().running_processes(device, kind, api) {
                Err(NativeError::FunctionNotFound) => {
                    debug!(field = kind.field(), generation = ?api, "generation not exported, falling back");
                }
                result => {
                    let _ = cell.set(Resolution::Resolved(api));
                    debug!(field = kind.field(), generation = ?api, "resolved process query generation");
                    return result;
                }
            }
        }

        let _ = cell.set(Resolution::Unresolved);
        warn!(
            field = kind.field(),
            "no known generation of the process query is exported; process list unavailable"
        );
        Err(NativeError::FunctionNotFound)
    }

    /// Read a device's memory info, preferring the versioned record
    pub fn memory_info(&self, device: DeviceHandle) -> NativeResult<RawMemoryInfo> {
        if let Some(api) = self.memory_api.get() {
            return self.library().memory_info(device, *api);
        }

        match self.library().memory_info(device, MemoryApi::V2) {
            Err(NativeError::FunctionNotFound) => {
                let _ = self.memory_api.set(MemoryApi::V1);
                debug!("versioned memory query not exported, using legacy record");
                self.library().memory_info(device, MemoryApi::V1)
            }
            result => {
                let _ = self.memory_api.set(MemoryApi::V2);
                debug!("using versioned memory query");
                result
            }
        }
    }

    /// Check the running driver for known defects
    ///
    /// Each distinct driver version is logged once; the advisories are
    /// returned every time.
    pub fn driver_advisories(&self, driver_version: &str) -> Vec<Advisory> {
        let advisories = match self.library().backend() {
            Backend::Nvml => {
                let has_memory_v2 = self.library().has_function(MEMORY_V2_SYMBOL);
                check_driver_version(driver_version, has_memory_v2)
            }
            Backend::AmdSmi => check_amd_driver_version(driver_version),
        };

        let mut warned = self.warned_driver.borrow_mut();
        if warned.as_deref() != Some(driver_version) {
            for advisory in &advisories {
                warn!(kind = ?advisory.kind, "{}", advisory.message);
            }
            *warned = Some(driver_version.to_string());
        }

        advisories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockNative};
    use crate::native::RawProcessInfo;

    fn proc(pid: u32, mb: u64) -> RawProcessInfo {
        RawProcessInfo {
            pid,
            used_gpu_memory: Some(mb * 1024 * 1024),
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("535.86.05"), vec![535, 86, 5]);
        assert_eq!(parse_version("415.27.mock"), vec![415, 27, 0]);
        assert_eq!(parse_version(" 510 "), vec![510]);
    }

    #[test]
    fn test_buggy_driver_range() {
        let advisories = check_driver_version("535.54.03", true);
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].kind, AdvisoryKind::IncompatibleDriver);
        assert!(advisories[0].message.contains("535.54.03"));

        assert!(check_driver_version("535.43", true).len() == 1);
        assert!(check_driver_version("535.42.99", true).is_empty());
        assert!(check_driver_version("535.86", true).is_empty());
        assert!(check_driver_version("535.104.05", true).is_empty());
    }

    #[test]
    fn test_memory_skew_advisory() {
        let advisories = check_driver_version("520.61.05", false);
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].kind, AdvisoryKind::LibrarySkew);
        assert!(check_driver_version("510.47.03", false).is_empty());
        assert!(check_driver_version("520.61.05", true).is_empty());
    }

    #[test]
    fn test_oldest_process_generation_only() {
        let native = MockNative::new()
            .with_process_apis(&[ProcessApi::V1])
            .with_device(MockDevice::new("GPU-0").with_compute(vec![proc(100, 512)]));
        let counters = native.counters();
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let list = compat.running_processes(handle, ProcessKind::Compute).unwrap();
        assert_eq!(list, vec![proc(100, 512)]);
        assert_eq!(
            compat.process_api(ProcessKind::Compute),
            Some(Resolution::Resolved(ProcessApi::V1))
        );

        // v3 and v2 were probed once, then v1 is used directly
        assert_eq!(counters.process_calls(ProcessApi::V3), 1);
        assert_eq!(counters.process_calls(ProcessApi::V2), 1);
        compat.running_processes(handle, ProcessKind::Compute).unwrap();
        assert_eq!(counters.process_calls(ProcessApi::V3), 1);
        assert_eq!(counters.process_calls(ProcessApi::V1), 2);
    }

    #[test]
    fn test_newest_process_generation_preferred() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_graphics(vec![proc(7, 64)]));
        let counters = native.counters();
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let list = compat.running_processes(handle, ProcessKind::Graphics).unwrap();
        assert_eq!(list, vec![proc(7, 64)]);
        assert_eq!(
            compat.process_api(ProcessKind::Graphics),
            Some(Resolution::Resolved(ProcessApi::V3))
        );
        assert_eq!(counters.process_calls(ProcessApi::V2), 0);
        assert_eq!(counters.process_calls(ProcessApi::V1), 0);
    }

    #[test]
    fn test_unresolved_generation_is_permanent() {
        let native = MockNative::new()
            .with_process_apis(&[])
            .with_device(MockDevice::new("GPU-0"));
        let counters = native.counters();
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let err = compat.running_processes(handle, ProcessKind::Compute).unwrap_err();
        assert_eq!(err, NativeError::FunctionNotFound);
        assert_eq!(
            compat.process_api(ProcessKind::Compute),
            Some(Resolution::Unresolved)
        );

        let calls = counters.total_process_calls();
        let err = compat.running_processes(handle, ProcessKind::Compute).unwrap_err();
        assert_eq!(err, NativeError::FunctionNotFound);
        assert_eq!(counters.total_process_calls(), calls);
    }

    #[test]
    fn test_not_supported_does_not_downgrade() {
        let native = MockNative::new().with_device(
            MockDevice::new("GPU-0").with_compute_error(NativeError::NotSupported),
        );
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let err = compat.running_processes(handle, ProcessKind::Compute).unwrap_err();
        assert_eq!(err, NativeError::NotSupported);
        assert_eq!(
            compat.process_api(ProcessKind::Compute),
            Some(Resolution::Resolved(ProcessApi::V3))
        );
    }

    #[test]
    fn test_versioned_memory_preferred() {
        // The legacy record counts reserved memory as used on this driver
        let native = MockNative::new().with_device(
            MockDevice::new("GPU-0").with_memory(8 * 1024, 2 * 1024, 300),
        );
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let mem = compat.memory_info(handle).unwrap();
        assert_eq!(compat.memory_api(), Some(MemoryApi::V2));
        assert_eq!(mem.used, 2 * 1024 * 1024 * 1024);
        assert_eq!(mem.reserved, Some(300 * 1024 * 1024));
    }

    #[test]
    fn test_legacy_memory_fallback() {
        let native = MockNative::new()
            .with_memory_v2(false)
            .with_device(MockDevice::new("GPU-0").with_memory(8 * 1024, 2 * 1024, 300));
        let compat = Compat::open(native).unwrap();
        let handle = compat.library().handle_by_index(0).unwrap();

        let mem = compat.memory_info(handle).unwrap();
        assert_eq!(compat.memory_api(), Some(MemoryApi::V1));
        assert_eq!(mem.reserved, None);
        assert_eq!(mem.used, (2 * 1024 + 300) * 1024 * 1024);
    }

    #[test]
    fn test_driver_advisories_use_library_capabilities() {
        let compat = Compat::open(MockNative::new().with_memory_v2(false)).unwrap();
        let advisories = compat.driver_advisories("535.54.03");
        assert_eq!(advisories.len(), 2);
        // Repeated checks still annotate
        assert_eq!(compat.driver_advisories("535.54.03"), advisories);
    }

    #[test]
    fn test_untested_amd_driver() {
        let advisories = check_amd_driver_version("6.3.6");
        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].kind, AdvisoryKind::UntestedDriver);
        assert!(advisories[0].message.contains("ROCM Driver 6.3.6"));
        assert!(check_amd_driver_version("6.7.8").is_empty());
        assert!(check_amd_driver_version("6.10.5").is_empty());
    }

    #[test]
    fn test_driver_advisories_follow_backend() {
        // NVIDIA rules do not apply to an AMD driver version and vice versa
        let compat = Compat::open(
            MockNative::new()
                .with_backend(Backend::AmdSmi)
                .with_memory_v2(false),
        )
        .unwrap();
        assert!(compat.driver_advisories("535.54.03").is_empty());
        assert_eq!(
            compat.driver_advisories("6.2.4")[0].kind,
            AdvisoryKind::UntestedDriver
        );

        let compat = Compat::open(MockNative::new()).unwrap();
        assert!(compat.driver_advisories("6.2.4").is_empty());
    }
}
