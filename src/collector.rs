//! Poll orchestration
//!
//! A [`Collector`] owns the initialized native library, the compatibility
//! resolutions and the process cache. Each call to
//! [`collect`](Collector::collect) produces one immutable [`Collection`].
//!
//! `collect` takes `&mut self`: polls on one collector are serialized by
//! construction. Share a collector between threads through a
//! `Mutex<Collector<..>>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::compat::Compat;
use crate::config::CollectorConfig;
use crate::enumerate::{enumerate, DeviceFilter};
use crate::error::{Error, NativeError, Result};
use crate::native::{Backend, ClockType, DeviceHandle, NativeLibrary, ProcessKind};
use crate::probe::{Diagnostics, Probe};
use crate::process::{merge_process_lists, ProcessEnricher, ProcessInspector};
use crate::types::{
    Collection, DeviceMetrics, DeviceSnapshot, FailureClass, GpuStat, Megabytes, UnavailableDevice,
};

const MIB: u64 = 1024 * 1024;

/// Handle for controlling background sampling
pub struct SamplingHandle {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SamplingHandle {
    /// Stop the background sampling
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Check if sampling is still running
    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::SeqCst)
    }
}

impl Drop for SamplingHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Host name for the collection header
fn hostname() -> String {
    #[cfg(target_os = "linux")]
    let name = crate::linux::hostname();
    #[cfg(target_os = "windows")]
    let name = crate::windows::hostname();
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let name: Option<String> = None;

    name.unwrap_or_else(|| "localhost".to_string())
}

fn to_megabytes(bytes: u64) -> Megabytes {
    bytes / MIB
}

fn milliwatts_to_watts(mw: u32) -> u32 {
    mw / 1000
}

fn unavailable(index: u32, error: NativeError) -> DeviceSnapshot {
    DeviceSnapshot::Unavailable(UnavailableDevice {
        index,
        failure: FailureClass::from_error(&error),
        error,
    })
}

/// Collects GPU telemetry snapshots
pub struct Collector<N: NativeLibrary, P: ProcessInspector> {
    compat: Compat<N>,
    enricher: ProcessEnricher<P>,
    config: CollectorConfig,
    hostname: String,
}

impl<N: NativeLibrary, P: ProcessInspector> Collector<N, P> {
    /// Initialize `native` and build a collector around it
    ///
    /// The native library is shut down when the collector is dropped.
    pub fn new(native: N, inspector: P, config: CollectorConfig) -> Result<Self> {
        let backend = native.backend();
        let compat = Compat::open(native).map_err(Error::Initialization)?;
        let enricher = ProcessEnricher::new(inspector, config.cpu_sample_interval, config.purge_every);
        let hostname = hostname();
        info!(hostname = %hostname, %backend, "GPU telemetry collector ready");

        Ok(Self {
            compat,
            enricher,
            config,
            hostname,
        })
    }

    /// The configuration in use
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The compatibility layer, for inspecting resolved generations
    pub fn compat(&self) -> &Compat<N> {
        &self.compat
    }

    /// Vendor library behind this collector
    pub fn backend(&self) -> Backend {
        self.compat.library().backend()
    }

    /// The process enricher and its cache
    pub fn enricher(&self) -> &ProcessEnricher<P> {
        &self.enricher
    }

    /// Number of devices the native library reports
    pub fn device_count(&self) -> Result<u32> {
        self.compat.library().device_count().map_err(Error::DeviceCount)
    }

    /// Poll every selected device once
    ///
    /// Only an unreadable device count or an invalid filter fail the poll;
    /// everything else degrades to unavailable fields or devices.
    pub fn collect(&mut self, filter: Option<&DeviceFilter>) -> Result<Collection> {
        let query_time = Local::now();
        let mut diagnostics = Diagnostics::new();

        let devices = enumerate(self.compat.library(), filter)?;
        let mut gpus = Vec::with_capacity(devices.len());
        for (index, handle) in devices {
            // a failed query was already recorded under its field by the probe
            let snapshot = match handle {
                Ok(handle) => self.collect_device(index, handle, &mut diagnostics),
                Err(e) => {
                    diagnostics.record(Some(index), &format!("GPU {}", index), &e);
                    unavailable(index, e)
                }
            };
            gpus.push(snapshot);
        }

        let records = gpus
            .iter_mut()
            .filter_map(|snapshot| match snapshot {
                DeviceSnapshot::Available(gpu) => gpu.processes.as_mut(),
                DeviceSnapshot::Unavailable(_) => None,
            })
            .flatten();
        self.enricher.finish_poll(records);

        let driver_version = match self.compat.library().driver_version() {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(error = %e, "failed to read driver version");
                diagnostics.record(None, "driver_version", &e);
                None
            }
        };
        let advisories = driver_version
            .as_deref()
            .map(|version| self.compat.driver_advisories(version))
            .unwrap_or_default();

        if self.config.debug {
            diagnostics.log();
        }
        debug!(
            devices = gpus.len(),
            failures = diagnostics.total(),
            "poll complete"
        );

        Ok(Collection::new(
            self.hostname.clone(),
            driver_version,
            query_time,
            gpus,
            advisories,
            diagnostics,
        ))
    }

    /// Query one opened device
    ///
    /// Identity fields are required; losing the device at any point demotes
    /// it to unavailable.
    fn collect_device(
        &mut self,
        index: u32,
        handle: DeviceHandle,
        diagnostics: &mut Diagnostics,
    ) -> DeviceSnapshot {
        let compat = &self.compat;
        let lib = compat.library();
        let mut probe = Probe::new(index, diagnostics);

        let name = probe.require("name", || lib.name(handle));
        let uuid = probe.require("uuid", || lib.uuid(handle));
        let (name, uuid) = match (name, uuid) {
            (Ok(name), Ok(uuid)) => (name, uuid),
            (Err(e), _) | (_, Err(e)) => return unavailable(index, e),
        };

        let memory = probe.probe("memory", || compat.memory_info(handle));
        let metrics = DeviceMetrics {
            temperature: probe.probe("temperature.gpu", || lib.temperature(handle)),
            fan_speed: probe.probe("fan.speed", || lib.fan_speed(handle)),
            utilization: probe
                .probe("utilization.gpu", || lib.utilization_rates(handle))
                .map(|u| u.gpu),
            utilization_enc: probe
                .probe("utilization.enc", || lib.encoder_utilization(handle))
                .map(|u| u.value),
            utilization_dec: probe
                .probe("utilization.dec", || lib.decoder_utilization(handle))
                .map(|u| u.value),
            power_draw: probe
                .probe("power.draw", || lib.power_usage(handle))
                .map(milliwatts_to_watts),
            power_limit: probe
                .probe("enforced.power.limit", || lib.enforced_power_limit(handle))
                .map(milliwatts_to_watts),
            memory_used: memory.map(|m| to_megabytes(m.used)),
            memory_total: memory.map(|m| to_megabytes(m.total)),
            clock: probe.probe("clocks.current", || lib.clock_info(handle, ClockType::Graphics)),
            clock_max: probe.probe("clocks.max", || {
                lib.max_clock_info(handle, ClockType::Graphics)
            }),
        };

        let compute = probe.probe(ProcessKind::Compute.field(), || {
            compat.running_processes(handle, ProcessKind::Compute)
        });
        let graphics = probe.probe(ProcessKind::Graphics.field(), || {
            compat.running_processes(handle, ProcessKind::Graphics)
        });

        if let Some(e) = probe.finish() {
            return unavailable(index, e);
        }

        let mut processes = merge_process_lists(compute, graphics);
        if let Some(records) = processes.as_mut() {
            self.enricher.enrich(records);
        }

        DeviceSnapshot::Available(GpuStat {
            index,
            uuid,
            name,
            metrics,
            processes,
        })
    }
}

impl<N, P> Collector<N, P>
where
    N: NativeLibrary + 'static,
    P: ProcessInspector + 'static,
{
    /// Start continuous sampling with a callback
    ///
    /// The collector moves into a background thread that polls every
    /// `interval` and passes each collection to `callback`. Sampling stops
    /// when the returned handle is stopped or dropped, or when a poll fails.
    pub fn start_sampling<F>(
        mut self,
        interval: Duration,
        filter: Option<DeviceFilter>,
        mut callback: F,
    ) -> Result<SamplingHandle>
    where
        F: FnMut(Collection) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::invalid_config("sampling interval must be non-zero"));
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();

        let thread = thread::spawn(move || {
            while !stop_flag_clone.load(Ordering::SeqCst) {
                thread::sleep(interval);

                match self.collect(filter.as_ref()) {
                    Ok(collection) => callback(collection),
                    Err(e) => {
                        warn!(error = %e, "sampling stopped");
                        stop_flag_clone.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        Ok(SamplingHandle {
            stop_flag,
            thread: Some(thread),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockField, MockNative, MockProcess, MockProcesses};
    use crate::native::{ProcessApi, RawProcessInfo};
    use std::sync::mpsc;

    fn config() -> CollectorConfig {
        CollectorConfig::default().with_cpu_sample_interval(Duration::ZERO)
    }

    fn collector(native: MockNative) -> Collector<MockNative, MockProcesses> {
        Collector::new(native, MockProcesses::new(), config()).unwrap()
    }

    fn proc(pid: u32, mb: u64) -> RawProcessInfo {
        RawProcessInfo {
            pid,
            used_gpu_memory: Some(mb * MIB),
        }
    }

    #[test]
    fn test_one_entry_per_device() {
        for k in 0..5 {
            let mut collector = collector(MockNative::new().with_devices(k));
            let collection = collector.collect(None).unwrap();
            assert_eq!(collection.len(), k);
            for (position, gpu) in collection.iter().enumerate() {
                assert_eq!(gpu.index() as usize, position);
                assert!(gpu.is_available());
            }
        }
    }

    #[test]
    fn test_metrics_converted() {
        let native = MockNative::new().with_device(
            MockDevice::new("GPU-0")
                .with_name("Mock A100")
                .with_power(71_500, 300_000)
                .with_memory(40_960, 2048, 512)
                .with_utilization(0, 3),
        );
        let mut collector = collector(native);
        let collection = collector.collect(None).unwrap();
        let gpu = collection.get(0).and_then(DeviceSnapshot::as_available).unwrap();

        assert_eq!(gpu.name, "Mock A100");
        assert_eq!(gpu.uuid, "GPU-0");
        assert_eq!(gpu.metrics.power_draw, Some(71));
        assert_eq!(gpu.metrics.power_limit, Some(300));
        assert_eq!(gpu.metrics.memory_used, Some(2048));
        assert_eq!(gpu.metrics.memory_total, Some(40_960));
        // zero is a value, not unavailability
        assert_eq!(gpu.metrics.utilization, Some(0));
        assert_eq!(gpu.metrics.clock, Some(1500));
        assert_eq!(gpu.metrics.clock_max, Some(2100));
        assert_eq!(gpu.processes, Some(vec![]));
    }

    #[test]
    fn test_single_probe_failure_isolated() {
        let native = MockNative::new()
            .with_device(
                MockDevice::new("GPU-0")
                    .with_error(MockField::FanSpeed, NativeError::NotSupported)
                    .with_compute(vec![proc(10, 100)]),
            )
            .with_device(MockDevice::new("GPU-1"));
        let mut collector = Collector::new(
            native,
            MockProcesses::new().with_process(MockProcess::new(10, "alice", &["python"])),
            config(),
        )
        .unwrap();
        let collection = collector.collect(None).unwrap();

        let gpu = collection.get(0).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(gpu.metrics.fan_speed, None);
        assert_eq!(gpu.metrics.temperature, Some(45));
        assert_eq!(gpu.metrics.memory_used, Some(1024));
        assert_eq!(gpu.metrics.utilization, Some(50));
        let processes = gpu.processes.as_ref().unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].username.as_deref(), Some("alice"));

        let other = collection.get(1).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(other.metrics.fan_speed, Some(30));

        assert_eq!(collection.diagnostics().len(), 1);
        assert_eq!(collection.diagnostics().entries()[0].field, "fan.speed");
    }

    #[test]
    fn test_lost_device_keeps_others() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0"))
            .with_device(MockDevice::new("GPU-1").with_open_error(NativeError::GpuIsLost))
            .with_device(MockDevice::new("GPU-2"));
        let mut collector = collector(native);
        let collection = collector.collect(None).unwrap();

        assert_eq!(collection.len(), 3);
        let indices: Vec<u32> = collection.iter().map(DeviceSnapshot::index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        match collection.get(1).unwrap() {
            DeviceSnapshot::Unavailable(device) => {
                assert_eq!(device.failure, FailureClass::DeviceLost);
                assert_eq!(device.error, NativeError::GpuIsLost);
            }
            other => panic!("expected unavailable device, got {:?}", other),
        }
        assert_eq!(collection.get(1).unwrap().name(), "((GPU is lost))");
        assert_eq!(collection.get(2).unwrap().name(), "Mock GPU");
        assert_eq!(collection.available().count(), 2);
    }

    #[test]
    fn test_unknown_open_error() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_open_error(NativeError::Unknown));
        let collection = collector(native).collect(None).unwrap();
        assert_eq!(collection.get(0).unwrap().name(), "((Unknown Error))");
    }

    #[test]
    fn test_device_lost_mid_poll() {
        let native = MockNative::new()
            .with_device(
                MockDevice::new("GPU-0").with_error(MockField::PowerUsage, NativeError::GpuIsLost),
            )
            .with_device(MockDevice::new("GPU-1"));
        let collection = collector(native).collect(None).unwrap();

        assert!(!collection.get(0).unwrap().is_available());
        assert!(collection.get(1).unwrap().is_available());
    }

    #[test]
    fn test_failed_device_recorded_once() {
        let native = MockNative::new()
            .with_device(
                MockDevice::new("GPU-0").with_error(MockField::PowerUsage, NativeError::GpuIsLost),
            )
            .with_device(MockDevice::new("GPU-1").with_open_error(NativeError::GpuIsLost))
            .with_device(MockDevice::new("GPU-2").with_error(MockField::Uuid, NativeError::Unknown));
        let collection = collector(native).collect(None).unwrap();

        assert_eq!(collection.available().count(), 0);
        let fields: Vec<&str> = collection
            .diagnostics()
            .entries()
            .iter()
            .map(|entry| entry.field.as_str())
            .collect();
        assert_eq!(fields, vec!["power.draw", "GPU 1", "uuid"]);
        assert_eq!(collection.diagnostics().total(), 3);
    }

    #[test]
    fn test_identity_failure_demotes_device() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_error(MockField::Uuid, NativeError::Unknown));
        let collection = collector(native).collect(None).unwrap();
        match collection.get(0).unwrap() {
            DeviceSnapshot::Unavailable(device) => {
                assert_eq!(device.failure, FailureClass::UnknownError)
            }
            other => panic!("expected unavailable device, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_metric_error_is_field_level() {
        let native = MockNative::new().with_device(
            MockDevice::new("GPU-0").with_error(MockField::Temperature, NativeError::Unknown),
        );
        let collection = collector(native).collect(None).unwrap();
        let gpu = collection.get(0).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(gpu.metrics.temperature, None);
        assert_eq!(gpu.metrics.fan_speed, Some(30));
    }

    #[test]
    fn test_process_dedup_across_lists() {
        let native = MockNative::new().with_device(
            MockDevice::new("GPU-0")
                .with_compute(vec![proc(100, 300)])
                .with_graphics(vec![proc(100, 20), proc(101, 40)]),
        );
        let mut collector = collector(native);
        let collection = collector.collect(None).unwrap();
        let processes = collection.available().next().unwrap().processes.clone().unwrap();

        let pids: Vec<u32> = processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![100, 101]);
        assert_eq!(processes[0].gpu_memory_usage, Some(300));
    }

    #[test]
    fn test_vanished_process_does_not_fail_device() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_compute(vec![proc(4242, 64)]));
        let mut collector = collector(native);
        let collection = collector.collect(None).unwrap();

        let gpu = collection.available().next().unwrap();
        let processes = gpu.processes.as_ref().unwrap();
        assert_eq!(processes.len(), 1);
        assert!(processes[0].is_os_unavailable());
        assert_eq!(processes[0].gpu_memory_usage, Some(64));
        assert!(collection.diagnostics().is_empty());
    }

    #[test]
    fn test_oldest_process_generation_end_to_end() {
        let native = MockNative::new()
            .with_process_apis(&[ProcessApi::V1])
            .with_device(MockDevice::new("GPU-0").with_compute(vec![proc(9, 128)]));
        let counters = native.counters();
        let mut collector = collector(native);

        for _ in 0..2 {
            let collection = collector.collect(None).unwrap();
            let gpu = collection.available().next().unwrap();
            assert_eq!(gpu.processes.as_ref().unwrap()[0].gpu_memory_usage, Some(128));
        }
        // resolution happened once per list kind
        assert_eq!(counters.process_calls(ProcessApi::V3), 2);
        assert_eq!(counters.process_calls(ProcessApi::V1), 4);
    }

    #[test]
    fn test_versioned_memory_selected() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_memory(16_384, 4096, 700));
        let counters = native.counters();
        let collection = collector(native).collect(None).unwrap();

        let gpu = collection.available().next().unwrap();
        assert_eq!(gpu.metrics.memory_used, Some(4096));
        assert_eq!(counters.memory_calls(crate::native::MemoryApi::V1), 0);
    }

    #[test]
    fn test_consecutive_polls_identical() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_compute(vec![proc(1, 10)]))
            .with_device(MockDevice::new("GPU-1").with_open_error(NativeError::GpuIsLost));
        let processes = MockProcesses::new()
            .with_process(MockProcess::new(1, "root", &["/sbin/init"]).with_cpu_percent(3.0));
        let mut collector = Collector::new(native, processes, config()).unwrap();

        let first = collector.collect(None).unwrap();
        let second = collector.collect(None).unwrap();
        assert_eq!(first.hostname(), second.hostname());
        assert_eq!(first.driver_version(), second.driver_version());
        assert_eq!(first.gpus(), second.gpus());
        assert_eq!(first.advisories(), second.advisories());
    }

    #[test]
    fn test_three_device_scenario() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-healthy"))
            .with_device(
                MockDevice::new("GPU-shared")
                    .with_compute(vec![proc(200, 1000), proc(201, 500)])
                    .with_graphics(vec![proc(200, 1000)]),
            )
            .with_device(
                MockDevice::new("GPU-limited")
                    .with_error(MockField::Utilization, NativeError::NotSupported)
                    .with_compute_error(NativeError::NotSupported)
                    .with_graphics_error(NativeError::NotSupported),
            );
        let processes = MockProcesses::new()
            .with_process(MockProcess::new(200, "alice", &["/usr/bin/python3", "train.py"]))
            .with_process(MockProcess::new(201, "bob", &["render"]));
        let mut collector = Collector::new(native, processes, config()).unwrap();
        let collection = collector.collect(None).unwrap();

        assert_eq!(collection.len(), 3);

        let healthy = collection.get(0).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(healthy.metrics.utilization, Some(50));
        assert_eq!(healthy.processes, Some(vec![]));

        let shared = collection.get(1).and_then(DeviceSnapshot::as_available).unwrap();
        let shared_processes = shared.processes.as_ref().unwrap();
        assert_eq!(shared_processes.len(), 2);
        assert_eq!(shared_processes[0].command.as_deref(), Some("python3"));
        assert_eq!(shared_processes[1].username.as_deref(), Some("bob"));
        assert_eq!(shared.metrics.utilization, Some(50));

        let limited = collection.get(2).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(limited.metrics.utilization, None);
        assert_eq!(limited.processes, None);
        assert_eq!(limited.metrics.temperature, Some(45));
    }

    #[test]
    fn test_filter_applied() {
        let mut collector = collector(MockNative::new().with_devices(3));
        let filter = DeviceFilter::parse("2,0").unwrap();
        let collection = collector.collect(Some(&filter)).unwrap();
        let indices: Vec<u32> = collection.iter().map(DeviceSnapshot::index).collect();
        assert_eq!(indices, vec![2, 0]);

        let err = collector
            .collect(Some(&DeviceFilter::from_indices([3])))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_driver_version_failure_is_not_fatal() {
        let native = MockNative::new()
            .with_devices(1)
            .with_driver_version_error(NativeError::Unknown);
        let collection = collector(native).collect(None).unwrap();
        assert_eq!(collection.driver_version(), None);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_driver_version_read_once_per_poll() {
        let native = MockNative::new().with_devices(4);
        let counters = native.counters();
        collector(native).collect(None).unwrap();
        assert_eq!(counters.driver_version_calls(), 1);
        assert_eq!(counters.device_count_calls(), 1);
    }

    #[test]
    fn test_advisory_annotates_collection() {
        let native = MockNative::new()
            .with_devices(1)
            .with_driver_version("535.54.03");
        let collection = collector(native).collect(None).unwrap();
        assert_eq!(collection.advisories().len(), 1);
        assert!(collection.get(0).unwrap().is_available());
    }

    #[test]
    fn test_amd_backend_collection() {
        let native = MockNative::new()
            .with_backend(Backend::AmdSmi)
            .with_driver_version("6.3.6")
            .with_device(MockDevice::new("GPU-0").with_compute(vec![proc(31, 2048)]));
        let mut collector = Collector::new(
            native,
            MockProcesses::new().with_process(MockProcess::new(31, "carol", &["hipcc"])),
            config(),
        )
        .unwrap();
        assert_eq!(collector.backend(), Backend::AmdSmi);

        let collection = collector.collect(None).unwrap();
        assert_eq!(collection.driver_version(), Some("6.3.6"));
        assert_eq!(collection.advisories().len(), 1);
        assert_eq!(collection.advisories()[0].kind, crate::AdvisoryKind::UntestedDriver);
        let gpu = collection.get(0).and_then(DeviceSnapshot::as_available).unwrap();
        assert_eq!(gpu.processes.as_ref().unwrap()[0].gpu_memory_usage, Some(2048));
    }

    #[test]
    fn test_initialization_failure() {
        let native = MockNative::new().with_init_error(NativeError::DriverNotLoaded);
        let err = Collector::new(native, MockProcesses::new(), config())
            .err()
            .unwrap();
        assert!(err.is_initialization_failure());
    }

    #[test]
    fn test_device_count_failure() {
        let native = MockNative::new().with_device_count_error(NativeError::Uninitialized);
        let mut collector = collector(native);
        assert!(collector.collect(None).unwrap_err().is_initialization_failure());
    }

    #[test]
    fn test_shutdown_on_drop() {
        let native = MockNative::new().with_devices(1);
        let counters = native.counters();
        {
            let mut collector = collector(native);
            collector.collect(None).unwrap();
            collector.collect(None).unwrap();
        }
        assert_eq!(counters.init_calls(), 1);
        assert_eq!(counters.shutdown_calls(), 1);
    }

    #[test]
    fn test_serialized_collection() {
        let native = MockNative::new()
            .with_device(MockDevice::new("GPU-0").with_error(MockField::FanSpeed, NativeError::NotSupported))
            .with_device(MockDevice::new("GPU-1").with_open_error(NativeError::GpuIsLost));
        let collection = collector(native).collect(None).unwrap();
        let json = serde_json::to_value(&collection).unwrap();

        assert!(json["query_time"].is_string());
        assert_eq!(json["driver_version"], "550.54.14");
        assert!(json["gpus"][0]["fan.speed"].is_null());
        assert_eq!(json["gpus"][0]["temperature.gpu"], 45);
        assert_eq!(json["gpus"][1]["name"], "((GPU is lost))");
        assert!(json["gpus"][1]["processes"].is_null());
        assert!(json.get("advisories").is_none());
    }

    #[test]
    fn test_sampling() {
        let collector = collector(MockNative::new().with_devices(2));
        let (tx, rx) = mpsc::channel();
        let handle = collector
            .start_sampling(Duration::from_millis(5), None, move |collection| {
                let _ = tx.send(collection.len());
            })
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, 2);
        assert!(handle.is_running());
        handle.stop();
    }

    #[test]
    fn test_sampling_rejects_zero_interval() {
        let collector = collector(MockNative::new());
        assert!(collector
            .start_sampling(Duration::ZERO, None, |_| {})
            .is_err());
    }
}
