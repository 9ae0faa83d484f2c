//! GPU Telemetry Library
//!
//! Polls NVIDIA GPUs through NVML, or AMD GPUs through AMD SMI, and
//! correlates the driver's per-process GPU memory with host process metadata,
//! producing one immutable [`Collection`] per poll.
//!
//! Every query can fail on its own: a field the device does not support is
//! `None`, a device that cannot be opened or falls off the bus becomes an
//! [`DeviceSnapshot::Unavailable`] placeholder, and a process that exits
//! mid-poll keeps its driver-reported fields. Only a missing or broken
//! native library and an invalid device filter fail a poll.
//!
//! # Platform Support
//!
//! - **Linux**: NVML via `libnvidia-ml.so.1` or AMD SMI via `libamd_smi.so`,
//!   process metadata via `/proc`
//! - **Windows**: NVML via `nvml.dll`, process metadata via the Win32 API
//!
//! [`Collector::open`] uses NVML when it loads and initializes, and AMD SMI
//! otherwise. Set `GPU_TELEMETRY_BACKEND` to `nvml` or `amdsmi` to skip the
//! probing.
//!
//! # Features
//!
//! - Temperature, fan speed, utilization, encoder/decoder load
//! - Power draw and enforced power limit
//! - Memory used/total, read through the versioned query when available
//! - Graphics clock and its maximum
//! - Per-process GPU memory, owner, command line, CPU and host memory
//! - Transparent fallback across NVML process-query generations
//! - Advisories for driver releases with known defects or untested AMD drivers
//! - Continuous sampling with callbacks
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gpu_telemetry::Collector;
//!
//! let mut collector = Collector::open()?;
//! let collection = collector.collect(None)?;
//!
//! for gpu in collection.available() {
//!     println!(
//!         "[{}] {} | {:?} C | {:?} / {:?} MB",
//!         gpu.index, gpu.name, gpu.metrics.temperature,
//!         gpu.metrics.memory_used, gpu.metrics.memory_total,
//!     );
//! }
//! # Ok::<(), gpu_telemetry::Error>(())
//! ```
//!
//! # Selecting Devices
//!
//! ```rust,no_run
//! use gpu_telemetry::{Collector, DeviceFilter};
//!
//! let mut collector = Collector::open()?;
//! let filter: DeviceFilter = "0,2".parse()?;
//! let collection = collector.collect(Some(&filter))?;
//! # Ok::<(), gpu_telemetry::Error>(())
//! ```
//!
//! # Example with Continuous Sampling
//!
//! ```rust,no_run
//! use gpu_telemetry::Collector;
//! use std::time::Duration;
//!
//! let collector = Collector::open()?;
//!
//! // Poll every second
//! let handle = collector.start_sampling(Duration::from_secs(1), None, |collection| {
//!     for gpu in collection.available() {
//!         println!("{}: {:?}%", gpu.name, gpu.metrics.utilization);
//!     }
//! })?;
//!
//! std::thread::sleep(Duration::from_secs(5));
//! handle.stop();
//! # Ok::<(), gpu_telemetry::Error>(())
//! ```
//!
//! # Concurrency
//!
//! A [`Collector`] serializes its own polls through `&mut self`. Share one
//! across threads behind a `Mutex`. A poll cannot be cancelled; wrap it in an
//! external timeout and treat expiry as a failed poll.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod collector;
pub mod compat;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod native;
pub mod probe;
pub mod process;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

use std::path::Path;

use tracing::debug;

// Re-export main types at crate root
pub use collector::{Collector, SamplingHandle};
pub use compat::{Advisory, AdvisoryKind};
pub use config::CollectorConfig;
pub use enumerate::DeviceFilter;
pub use error::{Error, NativeError, ProcessError, Result};
pub use native::{AmdSmiLibrary, Backend, NativeLibrary, NvmlLibrary};
pub use probe::Diagnostics;
pub use process::{ProcessHandle, ProcessInspector};
pub use types::*;

/// Process inspector for the current platform
#[cfg(target_os = "linux")]
pub type DefaultInspector = linux::ProcfsInspector;

/// Process inspector for the current platform
#[cfg(target_os = "windows")]
pub type DefaultInspector = windows::Win32Inspector;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collector over whichever vendor library [`Collector::open`] selected
#[cfg(any(target_os = "linux", target_os = "windows"))]
pub type SystemCollector = Collector<Box<dyn NativeLibrary>, DefaultInspector>;

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl Collector<Box<dyn NativeLibrary>, DefaultInspector> {
    /// Load a vendor library and open a collector configured from the
    /// environment
    pub fn open() -> Result<Self> {
        Self::with_config(CollectorConfig::from_env()?)
    }

    /// Load a vendor library and open a collector with an explicit
    /// configuration
    pub fn with_config(config: CollectorConfig) -> Result<Self> {
        select_backend(&backend_candidates(&config), load_backend, |native| {
            Self::new(native, DefaultInspector::default(), config.clone())
        })
    }
}

/// Backends to try, with the library path each is loaded from
///
/// An explicit library path without an explicit backend pins NVML.
fn backend_candidates(config: &CollectorConfig) -> Vec<(Backend, Option<&Path>)> {
    let path = config.library_path.as_deref();
    match (config.backend, path) {
        (Some(backend), _) => vec![(backend, path)],
        (None, Some(path)) => vec![(Backend::Nvml, Some(path))],
        (None, None) => Backend::AUTO_ORDER.iter().map(|&backend| (backend, None)).collect(),
    }
}

fn load_backend(backend: Backend, path: Option<&Path>) -> Result<Box<dyn NativeLibrary>> {
    let native: Box<dyn NativeLibrary> = match (backend, path) {
        (Backend::Nvml, Some(path)) => Box::new(NvmlLibrary::load_from(path)?),
        (Backend::Nvml, None) => Box::new(NvmlLibrary::load()?),
        (Backend::AmdSmi, Some(path)) => Box::new(AmdSmiLibrary::load_from(path)?),
        (Backend::AmdSmi, None) => Box::new(AmdSmiLibrary::load()?),
    };
    Ok(native)
}

/// Load and open the first candidate that works
///
/// If every candidate failed, the first failure past loading is returned,
/// since a library that loads but will not initialize says more than one
/// that is absent. Otherwise the load failures are combined.
fn select_backend<T, L, F>(candidates: &[(Backend, Option<&Path>)], mut load: L, mut open: F) -> Result<T>
where
    L: FnMut(Backend, Option<&Path>) -> Result<Box<dyn NativeLibrary>>,
    F: FnMut(Box<dyn NativeLibrary>) -> Result<T>,
{
    let mut missing = Vec::new();
    let mut first_failure = None;
    for &(backend, path) in candidates {
        match load(backend, path).and_then(&mut open) {
            Ok(opened) => {
                debug!(%backend, "selected telemetry backend");
                return Ok(opened);
            }
            Err(Error::LibraryUnavailable { message }) => {
                debug!(%backend, %message, "telemetry backend not available");
                missing.push(format!("{}: {}", backend, message));
            }
            Err(e) => {
                debug!(%backend, error = %e, "telemetry backend failed to open");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Err(Error::LibraryUnavailable {
            message: missing.join("; "),
        }),
    }
}

/// Take a single snapshot of all GPUs with the environment's configuration
#[cfg(any(target_os = "linux", target_os = "windows"))]
pub fn new_query() -> Result<Collection> {
    Collector::open()?.collect(None)
}

/// Number of GPUs, or 0 if no vendor library can be loaded or initialized
pub fn gpu_count() -> u32 {
    let count = || -> Result<u32> {
        let config = CollectorConfig::from_env()?;
        let compat = select_backend(&backend_candidates(&config), load_backend, |native| {
            compat::Compat::open(native).map_err(Error::Initialization)
        })?;
        compat.library().device_count().map_err(Error::DeviceCount)
    };
    count().unwrap_or(0)
}

/// Check if at least one GPU can be queried
pub fn is_available() -> bool {
    gpu_count() > 0
}

/// Check if the current platform is supported
pub fn is_platform_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "windows"))
}
