//! Error types for gpu-telemetry

use std::io;
use thiserror::Error;

/// Result type alias for gpu-telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a single call into the native telemetry library
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Errors raised to the caller of a collection
///
/// Field- and device-level failures never surface here; they are absorbed
/// into the [`Collection`](crate::Collection) as unavailable values.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The native telemetry library could not be located or loaded
    #[error("Native telemetry library unavailable: {message}")]
    LibraryUnavailable {
        /// Description of the load failure
        message: String,
    },

    /// The native telemetry library refused to initialize
    #[error("Failed to initialize the native telemetry library: {0}")]
    Initialization(#[source] NativeError),

    /// The number of devices could not be determined
    #[error("Failed to query the device count: {0}")]
    DeviceCount(#[source] NativeError),

    /// A device filter entry is malformed or out of range
    #[error("Invalid device filter entry {entry:?}: {reason}")]
    InvalidDeviceFilter {
        /// The offending entry as given
        entry: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error
        message: String,
    },
}

impl Error {
    /// Returns true if no collection can be produced because the native
    /// layer is missing or broken
    pub fn is_initialization_failure(&self) -> bool {
        matches!(
            self,
            Error::LibraryUnavailable { .. } | Error::Initialization(_) | Error::DeviceCount(_)
        )
    }

    /// Returns true if the error was caused by caller-supplied configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidDeviceFilter { .. } | Error::InvalidConfig { .. }
        )
    }

    pub(crate) fn invalid_filter(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidDeviceFilter {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Error reported by the native telemetry library for one call
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NativeError {
    /// The library was not initialized
    #[error("Uninitialized")]
    Uninitialized,

    /// An argument was rejected
    #[error("Invalid Argument")]
    InvalidArgument,

    /// The device does not support the requested feature
    #[error("Not Supported")]
    NotSupported,

    /// The caller lacks permission for the query
    #[error("Insufficient Permissions")]
    NoPermission,

    /// The requested object does not exist
    #[error("Not Found")]
    NotFound,

    /// An output buffer was too small
    #[error("Insufficient Size")]
    InsufficientSize,

    /// The device fell off the bus or is otherwise inaccessible
    #[error("GPU is lost")]
    GpuIsLost,

    /// The entry point is not exported by the loaded library
    #[error("Function Not Found")]
    FunctionNotFound,

    /// The shared library could not be found
    #[error("Library Not Found")]
    LibraryNotFound,

    /// The kernel driver is not loaded
    #[error("Driver Not Loaded")]
    DriverNotLoaded,

    /// The library reported an unknown internal error
    #[error("Unknown Error")]
    Unknown,

    /// Any other return code
    #[error("Native error code {code}")]
    Other {
        /// Raw return code
        code: u32,
    },
}

impl NativeError {
    /// Returns true if this error means the whole device must be considered
    /// unavailable for the rest of the poll, whichever field raised it
    pub fn is_fatal_for_device(&self) -> bool {
        matches!(self, NativeError::GpuIsLost)
    }
}

/// Error looking up OS metadata for a process
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProcessError {
    /// The process exited or never existed
    #[error("No such process (pid={pid})")]
    NoSuchProcess {
        /// Process ID
        pid: u32,
    },

    /// The process exists but its metadata is not readable
    #[error("Access denied (pid={pid})")]
    AccessDenied {
        /// Process ID
        pid: u32,
    },

    /// The platform does not expose this attribute
    #[error("Not supported on this platform")]
    Unsupported,

    /// Any other I/O failure
    #[error("Failed to read process {pid}: {source}")]
    Io {
        /// Process ID
        pid: u32,
        /// The underlying IO error
        source: io::Error,
    },
}

impl ProcessError {
    /// Classify an IO error raised while reading a process' metadata
    pub(crate) fn from_io(pid: u32, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => ProcessError::NoSuchProcess { pid },
            io::ErrorKind::PermissionDenied => ProcessError::AccessDenied { pid },
            _ => ProcessError::Io { pid, source },
        }
    }

    /// Returns true if the process is gone
    pub fn is_vanished(&self) -> bool {
        matches!(self, ProcessError::NoSuchProcess { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::Initialization(NativeError::DriverNotLoaded).is_initialization_failure());
        assert!(Error::invalid_filter("x", "not an integer").is_config_error());
        assert!(!Error::DeviceCount(NativeError::Unknown).is_config_error());
    }

    #[test]
    fn test_fatal_native_errors() {
        assert!(NativeError::GpuIsLost.is_fatal_for_device());
        assert!(!NativeError::Unknown.is_fatal_for_device());
        assert!(!NativeError::NotSupported.is_fatal_for_device());
    }

    #[test]
    fn test_process_error_from_io() {
        let err = ProcessError::from_io(7, io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_vanished());
        let err = ProcessError::from_io(7, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, ProcessError::AccessDenied { pid: 7 }));
    }
}
