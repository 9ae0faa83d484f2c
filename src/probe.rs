//! Per-field fault isolation and the per-poll diagnostic log

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::error::NativeError;

/// One distinct failure message and how often it occurred
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEntry {
    /// Field that first produced this message
    pub field: String,
    /// Device on which it first occurred, if device-scoped
    pub device: Option<u32>,
    /// Rendered message
    pub message: String,
    /// Number of occurrences in the poll
    pub count: usize,
}

/// Failures recorded during one poll, deduplicated by message
///
/// Entries keep the order in which each message was first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<DiagnosticEntry>,
    by_message: HashMap<String, usize>,
}

impl Diagnostics {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `field` could not be read
    pub fn record(&mut self, device: Option<u32>, field: &str, error: &dyn fmt::Display) {
        let message = format!("> An error while retrieving `{}`: {}", field, error);
        if let Some(&slot) = self.by_message.get(&message) {
            self.entries[slot].count += 1;
            return;
        }
        self.by_message.insert(message.clone(), self.entries.len());
        self.entries.push(DiagnosticEntry {
            field: field.to_string(),
            device,
            message,
            count: 1,
        });
    }

    /// Distinct messages in first-seen order
    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    /// Returns true if nothing failed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct messages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of failures including repeats
    pub fn total(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// Emit every distinct message at `warn!`
    pub fn log(&self) {
        for entry in &self.entries {
            warn!(
                field = %entry.field,
                device = ?entry.device,
                occurrences = entry.count,
                "{}",
                entry.message
            );
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry.message)?;
            writeln!(f, "-> Total {} occurrences.", entry.count)?;
        }
        Ok(())
    }
}

/// Fault-isolating wrapper around the native queries of one device
///
/// A failed query becomes `None` plus a diagnostic entry. Once a query
/// reports that the device is gone, further queries are skipped and the
/// device is demoted by the caller.
pub struct Probe<'a> {
    index: u32,
    diagnostics: &'a mut Diagnostics,
    fatal: Option<NativeError>,
}

impl<'a> Probe<'a> {
    /// Start probing the device at `index`
    pub fn new(index: u32, diagnostics: &'a mut Diagnostics) -> Self {
        Self {
            index,
            diagnostics,
            fatal: None,
        }
    }

    /// Run one optional query
    pub fn probe<T, F>(&mut self, field: &str, query: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, NativeError>,
    {
        if self.fatal.is_some() {
            return None;
        }
        match query() {
            Ok(value) => Some(value),
            Err(e) => {
                self.diagnostics.record(Some(self.index), field, &e);
                if e.is_fatal_for_device() {
                    warn!(device = self.index, field, error = %e, "device lost during poll");
                    self.fatal = Some(e);
                }
                None
            }
        }
    }

    /// Run a query the device cannot be described without
    ///
    /// Any failure is fatal for the device.
    pub fn require<T, F>(&mut self, field: &str, query: F) -> Result<T, NativeError>
    where
        F: FnOnce() -> Result<T, NativeError>,
    {
        if let Some(e) = &self.fatal {
            return Err(e.clone());
        }
        query().map_err(|e| {
            self.diagnostics.record(Some(self.index), field, &e);
            warn!(device = self.index, field, error = %e, "device identity unreadable");
            self.fatal = Some(e.clone());
            e
        })
    }

    /// The error that made the device unusable, if any
    pub fn fatal(&self) -> Option<&NativeError> {
        self.fatal.as_ref()
    }

    /// Finish probing, returning the fatal error if one occurred
    pub fn finish(self) -> Option<NativeError> {
        self.fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_message() {
        let mut diagnostics = Diagnostics::new();
        for device in 0..3 {
            diagnostics.record(Some(device), "fan.speed", &NativeError::NotSupported);
        }
        diagnostics.record(Some(1), "power.draw", &NativeError::NoPermission);

        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics.total(), 4);
        assert_eq!(diagnostics.entries()[0].count, 3);
        assert_eq!(diagnostics.entries()[0].device, Some(0));
        assert_eq!(diagnostics.entries()[1].field, "power.draw");
    }

    #[test]
    fn test_report_format() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(Some(0), "fan.speed", &NativeError::NotSupported);
        diagnostics.record(Some(1), "fan.speed", &NativeError::NotSupported);
        assert_eq!(
            diagnostics.to_string(),
            "> An error while retrieving `fan.speed`: Not Supported\n-> Total 2 occurrences.\n"
        );
    }

    #[test]
    fn test_probe_isolates_failures() {
        let mut diagnostics = Diagnostics::new();
        let mut probe = Probe::new(0, &mut diagnostics);

        let fan: Option<u32> = probe.probe("fan.speed", || Err(NativeError::NotSupported));
        let temp = probe.probe("temperature.gpu", || Ok(41u32));
        assert_eq!(fan, None);
        assert_eq!(temp, Some(41));
        assert!(probe.finish().is_none());
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_zero_is_not_unavailable() {
        let mut diagnostics = Diagnostics::new();
        let mut probe = Probe::new(0, &mut diagnostics);
        assert_eq!(probe.probe("utilization.gpu", || Ok(0u32)), Some(0));
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_lost_device_stops_probing() {
        let mut diagnostics = Diagnostics::new();
        let mut probe = Probe::new(2, &mut diagnostics);

        let power: Option<u32> = probe.probe("power.draw", || Err(NativeError::GpuIsLost));
        assert_eq!(power, None);

        let mut called = false;
        let clock = probe.probe("clocks.current", || {
            called = true;
            Ok(1500u32)
        });
        assert_eq!(clock, None);
        assert!(!called);
        assert_eq!(probe.finish(), Some(NativeError::GpuIsLost));
    }

    #[test]
    fn test_required_field_failure_is_fatal() {
        let mut diagnostics = Diagnostics::new();
        let mut probe = Probe::new(0, &mut diagnostics);

        let name: Result<String, _> = probe.require("name", || Err(NativeError::Unknown));
        assert_eq!(name.unwrap_err(), NativeError::Unknown);
        assert_eq!(probe.fatal(), Some(&NativeError::Unknown));
        let uuid: Result<String, _> = probe.require("uuid", || Ok("GPU-1".to_string()));
        assert!(uuid.is_err());
    }
}
