//! OS process enrichment for GPU process lists
//!
//! The driver only knows pids and GPU memory. Everything else in a
//! [`ProcessRecord`] comes from the host OS through a [`ProcessInspector`],
//! whose handles are kept in a [`ProcessCache`] across polls so that CPU
//! usage can be measured between two reads of the same handle.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::ProcessError;
use crate::native::RawProcessInfo;
use crate::types::{Megabytes, ProcessRecord};

const MIB: u64 = 1024 * 1024;

/// Access to the host's process table
pub trait ProcessInspector: Send {
    /// Handle type for one process
    type Handle: ProcessHandle;

    /// Open a handle to a running process
    fn open(&self, pid: u32) -> Result<Self::Handle, ProcessError>;

    /// Returns true if a process with this pid exists
    fn pid_exists(&self, pid: u32) -> bool;

    /// Installed host memory in bytes
    fn total_memory(&self) -> Option<u64>;
}

/// An open reference to one OS process
pub trait ProcessHandle: Send {
    /// Process ID
    fn pid(&self) -> u32;

    /// Returns true if the process this handle was opened on still runs
    ///
    /// A pid reused by a newer process counts as not running.
    fn is_running(&self) -> bool;

    /// Name of the owning user
    fn username(&self) -> Result<String, ProcessError>;

    /// Argument vector; empty for kernel threads and zombies
    fn cmdline(&self) -> Result<Vec<String>, ProcessError>;

    /// CPU usage since the previous call on this handle, in percent of one
    /// core; the first call returns 0.0
    fn cpu_percent(&mut self) -> Result<f64, ProcessError>;

    /// Resident memory as a percentage of host memory
    fn memory_percent(&self) -> Result<f64, ProcessError>;
}

/// Process handles kept across polls, keyed by pid
///
/// Not synchronized: owned by exactly one collector.
pub struct ProcessCache<H> {
    handles: HashMap<u32, H>,
}

impl<H: ProcessHandle> ProcessCache<H> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns true if a handle for `pid` is cached
    pub fn contains(&self, pid: u32) -> bool {
        self.handles.contains_key(&pid)
    }

    /// Cached handle for `pid`, if any
    pub fn get_mut(&mut self, pid: u32) -> Option<&mut H> {
        self.handles.get_mut(&pid)
    }

    /// Return the cached handle for `pid`, opening one if needed
    ///
    /// A cached handle whose process has exited or whose pid was reused is
    /// replaced.
    pub fn get_or_open<I>(&mut self, inspector: &I, pid: u32) -> Result<&mut H, ProcessError>
    where
        I: ProcessInspector<Handle = H>,
    {
        if matches!(self.handles.get(&pid), Some(handle) if !handle.is_running()) {
            debug!(pid, "cached process handle is stale");
            self.handles.remove(&pid);
        }
        match self.handles.entry(pid) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(inspector.open(pid)?)),
        }
    }

    /// Drop handles whose pid no longer exists; returns how many were dropped
    pub fn purge<I>(&mut self, inspector: &I) -> usize
    where
        I: ProcessInspector<Handle = H>,
    {
        let before = self.handles.len();
        self.handles.retain(|&pid, _| inspector.pid_exists(pid));
        let purged = before - self.handles.len();
        if purged > 0 {
            debug!(purged, remaining = self.handles.len(), "purged process cache");
        }
        purged
    }
}

impl<H: ProcessHandle> Default for ProcessCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a device's compute and graphics process lists
///
/// A pid present in both lists is reported once, with the values of its
/// first occurrence. Returns `None` only when neither list could be read.
pub fn merge_process_lists(
    compute: Option<Vec<RawProcessInfo>>,
    graphics: Option<Vec<RawProcessInfo>>,
) -> Option<Vec<ProcessRecord>> {
    if compute.is_none() && graphics.is_none() {
        return None;
    }

    let mut seen = HashSet::new();
    let records = compute
        .into_iter()
        .flatten()
        .chain(graphics.into_iter().flatten())
        .filter(|info| seen.insert(info.pid))
        .map(|info| ProcessRecord::new(info.pid, info.used_gpu_memory.map(to_megabytes)))
        .collect();
    Some(records)
}

fn to_megabytes(bytes: u64) -> Megabytes {
    bytes / MIB
}

/// Short command name: the basename of argv[0]
fn command_name(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_string())
}

/// Fills OS-derived fields of process records
///
/// Owns the process cache. A poll calls [`enrich`](Self::enrich) once per
/// device, then [`finish_poll`](Self::finish_poll) once.
pub struct ProcessEnricher<P: ProcessInspector> {
    inspector: P,
    cache: ProcessCache<P::Handle>,
    cpu_sample_interval: Duration,
    purge_every: u32,
    polls: u64,
    /// Pids whose CPU baseline was taken in the current poll
    baselined: HashSet<u32>,
}

impl<P: ProcessInspector> ProcessEnricher<P> {
    /// Create an enricher with an empty cache
    pub fn new(inspector: P, cpu_sample_interval: Duration, purge_every: u32) -> Self {
        Self {
            inspector,
            cache: ProcessCache::new(),
            cpu_sample_interval,
            purge_every,
            polls: 0,
            baselined: HashSet::new(),
        }
    }

    /// The process cache
    pub fn cache(&self) -> &ProcessCache<P::Handle> {
        &self.cache
    }

    /// The process inspector
    pub fn inspector(&self) -> &P {
        &self.inspector
    }

    /// Fill OS fields of one device's records and start their CPU window
    ///
    /// A process that cannot be opened or read keeps `None` in the affected
    /// fields; it is never dropped and never fails the device.
    pub fn enrich(&mut self, records: &mut [ProcessRecord]) {
        let total_memory = self.inspector.total_memory();

        for record in records.iter_mut() {
            let handle = match self.cache.get_or_open(&self.inspector, record.pid) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!(pid = record.pid, error = %e, "process metadata unavailable");
                    continue;
                }
            };

            record.username = handle.username().ok();
            match handle.cmdline() {
                Ok(argv) if !argv.is_empty() => {
                    record.command = Some(command_name(&argv[0]));
                    record.full_command = Some(argv);
                }
                Ok(_) => {}
                Err(e) => trace!(pid = record.pid, error = %e, "cmdline unavailable"),
            }
            record.cpu_memory_usage = match (handle.memory_percent(), total_memory) {
                (Ok(percent), Some(total)) => Some((percent / 100.0 * total as f64).round() as u64),
                _ => None,
            };

            // baseline read once per pid; a process on several devices shares one window
            if self.baselined.insert(record.pid) {
                if let Err(e) = handle.cpu_percent() {
                    trace!(pid = record.pid, error = %e, "cpu baseline unavailable");
                }
            }
        }
    }

    /// Close the CPU window for all records of the poll, then run cache
    /// maintenance
    ///
    /// Sleeps once for the sampling window, and only if any record was
    /// enriched. Each pid is read once; every record of that pid gets the
    /// same value.
    pub fn finish_poll<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a mut ProcessRecord>,
    {
        let records: Vec<&mut ProcessRecord> = records
            .into_iter()
            .filter(|record| self.cache.contains(record.pid))
            .collect();

        if !records.is_empty() {
            if !self.cpu_sample_interval.is_zero() {
                thread::sleep(self.cpu_sample_interval);
            }
            let mut samples: HashMap<u32, Option<f64>> = HashMap::new();
            for record in records {
                let pid = record.pid;
                let cache = &mut self.cache;
                record.cpu_percent = *samples.entry(pid).or_insert_with(|| {
                    cache
                        .get_mut(pid)
                        .and_then(|handle| handle.cpu_percent().ok())
                });
            }
        }
        self.baselined.clear();

        self.polls += 1;
        if self.purge_every > 0 && self.polls % u64::from(self.purge_every) == 0 {
            self.cache.purge(&self.inspector);
        }
    }
}
