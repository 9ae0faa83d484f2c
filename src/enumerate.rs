//! Device enumeration and device filters

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{Error, NativeResult, Result};
use crate::native::{DeviceHandle, NativeLibrary};

/// Restricts a poll to a subset of device indices
///
/// Indices are polled in the order given; a repeated index is polled once,
/// at its first position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    indices: Vec<u32>,
}

impl DeviceFilter {
    /// Build a filter from explicit indices
    pub fn from_indices<I: IntoIterator<Item = u32>>(indices: I) -> Self {
        let mut seen = HashSet::new();
        Self {
            indices: indices.into_iter().filter(|i| seen.insert(*i)).collect(),
        }
    }

    /// Parse a comma-separated list such as `"0,2"`
    pub fn parse(s: &str) -> Result<Self> {
        let indices = s
            .split(',')
            .map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return Err(Error::invalid_filter(entry, "empty entry"));
                }
                entry
                    .parse::<u32>()
                    .map_err(|_| Error::invalid_filter(entry, "not a non-negative integer"))
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(Self::from_indices(indices))
    }

    /// Selected indices in polling order
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Check every index against the device count
    fn resolve(&self, count: u32) -> Result<Vec<u32>> {
        for &index in &self.indices {
            if index >= count {
                return Err(Error::invalid_filter(
                    index.to_string(),
                    format!("only {} device(s) present", count),
                ));
            }
        }
        Ok(self.indices.clone())
    }
}

impl FromStr for DeviceFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.indices.iter().map(u32::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// One enumerated device: its index and the handle, or why it did not open
pub type EnumeratedDevice = (u32, NativeResult<DeviceHandle>);

/// Open a handle for every selected device
///
/// The device count is read once. A handle that fails to open is reported
/// in place and does not stop the remaining indices.
pub fn enumerate<N: NativeLibrary>(
    native: &N,
    filter: Option<&DeviceFilter>,
) -> Result<Vec<EnumeratedDevice>> {
    let count = native.device_count().map_err(Error::DeviceCount)?;
    let indices = match filter {
        Some(filter) => filter.resolve(count)?,
        None => (0..count).collect(),
    };
    debug!(count, selected = indices.len(), "enumerating devices");

    Ok(indices
        .into_iter()
        .map(|index| {
            let handle = native.handle_by_index(index);
            if let Err(e) = &handle {
                warn!(device = index, error = %e, "failed to open device handle");
            }
            (index, handle)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeError;
    use crate::mock::{MockDevice, MockNative};

    #[test]
    fn test_parse_filter() {
        let filter: DeviceFilter = " 2, 0 ,2".parse().unwrap();
        assert_eq!(filter.indices(), &[2, 0]);
        assert_eq!(filter.to_string(), "2,0");
    }

    #[test]
    fn test_parse_filter_rejects_garbage() {
        for input in ["", "0,,1", "a", "-1", "1.5"] {
            let err = DeviceFilter::parse(input).unwrap_err();
            assert!(err.is_config_error(), "{:?} should be rejected", input);
        }
    }

    #[test]
    fn test_enumerate_all() {
        let native = MockNative::new().with_devices(3);
        let devices = enumerate(&native, None).unwrap();
        let indices: Vec<u32> = devices.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(devices.iter().all(|(_, h)| h.is_ok()));
    }

    #[test]
    fn test_enumerate_no_devices() {
        let devices = enumerate(&MockNative::new(), None).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_open_failure_is_isolated() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0"))
            .with_device(MockDevice::new("GPU-1").with_open_error(NativeError::GpuIsLost))
            .with_device(MockDevice::new("GPU-2"));
        let devices = enumerate(&native, None).unwrap();

        assert_eq!(devices.len(), 3);
        assert!(devices[0].1.is_ok());
        assert_eq!(devices[1].1, Err(NativeError::GpuIsLost));
        assert!(devices[2].1.is_ok());
    }

    #[test]
    fn test_filter_selects_and_orders() {
        let native = MockNative::new().with_devices(4);
        let filter = DeviceFilter::from_indices([3, 1]);
        let devices = enumerate(&native, Some(&filter)).unwrap();
        let indices: Vec<u32> = devices.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![3, 1]);
    }

    #[test]
    fn test_filter_out_of_range() {
        let native = MockNative::new().with_devices(2);
        let filter = DeviceFilter::from_indices([0, 2]);
        let err = enumerate(&native, Some(&filter)).unwrap_err();
        assert!(matches!(err, Error::InvalidDeviceFilter { ref entry, .. } if entry == "2"));
    }

    #[test]
    fn test_count_failure() {
        let native = MockNative::new().with_device_count_error(NativeError::Uninitialized);
        let err = enumerate(&native, None).unwrap_err();
        assert!(err.is_initialization_failure());
    }
}
