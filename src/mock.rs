//! In-memory stand-ins for the native library and the OS process table
//!
//! Available to unit tests and, with the `mock` feature, to downstream crates
//! that want to exercise a [`Collector`](crate::Collector) without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{NativeError, NativeResult, ProcessError};
use crate::native::{
    Backend, ClockType, DeviceHandle, MemoryApi, NativeLibrary, ProcessApi, ProcessKind,
    RawCodecUtilization, RawMemoryInfo, RawProcessInfo, RawUtilization,
};
use crate::process::{ProcessHandle, ProcessInspector};

const MIB: u64 = 1024 * 1024;

/// A scalar query of [`MockDevice`] that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockField {
    /// Product name
    Name,
    /// Vendor UUID
    Uuid,
    /// Temperature
    Temperature,
    /// Fan speed
    FanSpeed,
    /// GPU/memory utilization
    Utilization,
    /// Encoder utilization
    EncoderUtilization,
    /// Decoder utilization
    DecoderUtilization,
    /// Power draw
    PowerUsage,
    /// Enforced power limit
    PowerLimit,
    /// Memory info, both generations
    Memory,
    /// Current clock
    Clock,
    /// Maximum clock
    MaxClock,
}

/// Scripted responses for one device
#[derive(Debug, Clone)]
pub struct MockDevice {
    open_error: Option<NativeError>,
    name: String,
    uuid: String,
    temperature: u32,
    fan_speed: u32,
    utilization: RawUtilization,
    encoder: u32,
    decoder: u32,
    power_mw: u32,
    power_limit_mw: u32,
    memory_total_mb: u64,
    memory_used_mb: u64,
    memory_reserved_mb: u64,
    clock: u32,
    clock_max: u32,
    compute: NativeResult<Vec<RawProcessInfo>>,
    graphics: NativeResult<Vec<RawProcessInfo>>,
    errors: HashMap<MockField, NativeError>,
}

impl MockDevice {
    /// A healthy device with no processes
    pub fn new(uuid: &str) -> Self {
        Self {
            open_error: None,
            name: "Mock GPU".to_string(),
            uuid: uuid.to_string(),
            temperature: 45,
            fan_speed: 30,
            utilization: RawUtilization { gpu: 50, memory: 20 },
            encoder: 0,
            decoder: 0,
            power_mw: 120_000,
            power_limit_mw: 250_000,
            memory_total_mb: 8192,
            memory_used_mb: 1024,
            memory_reserved_mb: 256,
            clock: 1500,
            clock_max: 2100,
            compute: Ok(Vec::new()),
            graphics: Ok(Vec::new()),
            errors: HashMap::new(),
        }
    }

    /// Set the product name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fail opening the handle
    pub fn with_open_error(mut self, error: NativeError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Fail one scalar query
    pub fn with_error(mut self, field: MockField, error: NativeError) -> Self {
        self.errors.insert(field, error);
        self
    }

    /// Set the temperature
    pub fn with_temperature(mut self, celsius: u32) -> Self {
        self.temperature = celsius;
        self
    }

    /// Set GPU and memory utilization
    pub fn with_utilization(mut self, gpu: u32, memory: u32) -> Self {
        self.utilization = RawUtilization { gpu, memory };
        self
    }

    /// Set power draw and limit in milliwatts
    pub fn with_power(mut self, draw_mw: u32, limit_mw: u32) -> Self {
        self.power_mw = draw_mw;
        self.power_limit_mw = limit_mw;
        self
    }

    /// Set memory in MiB
    ///
    /// The versioned query reports `used`; the legacy query reports
    /// `used + reserved`.
    pub fn with_memory(mut self, total_mb: u64, used_mb: u64, reserved_mb: u64) -> Self {
        self.memory_total_mb = total_mb;
        self.memory_used_mb = used_mb;
        self.memory_reserved_mb = reserved_mb;
        self
    }

    /// Set the compute process list
    pub fn with_compute(mut self, processes: Vec<RawProcessInfo>) -> Self {
        self.compute = Ok(processes);
        self
    }

    /// Set the graphics process list
    pub fn with_graphics(mut self, processes: Vec<RawProcessInfo>) -> Self {
        self.graphics = Ok(processes);
        self
    }

    /// Fail the compute process list
    pub fn with_compute_error(mut self, error: NativeError) -> Self {
        self.compute = Err(error);
        self
    }

    /// Fail the graphics process list
    pub fn with_graphics_error(mut self, error: NativeError) -> Self {
        self.graphics = Err(error);
        self
    }

    fn field<T>(&self, field: MockField, value: T) -> NativeResult<T> {
        match self.errors.get(&field) {
            Some(e) => Err(e.clone()),
            None => Ok(value),
        }
    }
}

#[derive(Debug, Default)]
struct CounterState {
    init: AtomicUsize,
    shutdown: AtomicUsize,
    device_count: AtomicUsize,
    driver_version: AtomicUsize,
    process: Mutex<HashMap<ProcessApi, usize>>,
    memory: Mutex<HashMap<MemoryApi, usize>>,
}

/// Call counters shared with a [`MockNative`]
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    state: Arc<CounterState>,
}

impl MockCounters {
    /// Number of `init` calls
    pub fn init_calls(&self) -> usize {
        self.state.init.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdown_calls(&self) -> usize {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Number of `device_count` calls
    pub fn device_count_calls(&self) -> usize {
        self.state.device_count.load(Ordering::SeqCst)
    }

    /// Number of `driver_version` calls
    pub fn driver_version_calls(&self) -> usize {
        self.state.driver_version.load(Ordering::SeqCst)
    }

    /// Number of process-list calls through one generation
    pub fn process_calls(&self, api: ProcessApi) -> usize {
        lock_count(&self.state.process, &api)
    }

    /// Number of process-list calls through any generation
    pub fn total_process_calls(&self) -> usize {
        self.state
            .process
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    /// Number of memory-info calls through one generation
    pub fn memory_calls(&self, api: MemoryApi) -> usize {
        lock_count(&self.state.memory, &api)
    }

    fn bump<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, usize>>, key: K) {
        if let Ok(mut calls) = map.lock() {
            *calls.entry(key).or_insert(0) += 1;
        }
    }
}

fn lock_count<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, usize>>, key: &K) -> usize {
    map.lock()
        .map(|calls| calls.get(key).copied().unwrap_or(0))
        .unwrap_or(0)
}

/// Scriptable [`NativeLibrary`]
///
/// Defaults to a library exporting every generation, a healthy driver and no
/// devices.
#[derive(Debug)]
pub struct MockNative {
    devices: Vec<MockDevice>,
    init_error: Option<NativeError>,
    device_count_error: Option<NativeError>,
    driver_version: NativeResult<String>,
    library_version: String,
    process_apis: Vec<ProcessApi>,
    memory_v2: bool,
    backend: Backend,
    counters: MockCounters,
}

impl MockNative {
    /// Create an empty mock
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            init_error: None,
            device_count_error: None,
            driver_version: Ok("550.54.14".to_string()),
            library_version: "12.550.54.14".to_string(),
            process_apis: ProcessApi::NEWEST_FIRST.to_vec(),
            memory_v2: true,
            backend: Backend::Nvml,
            counters: MockCounters::default(),
        }
    }

    /// Add a device at the next index
    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Add `count` healthy devices
    pub fn with_devices(mut self, count: usize) -> Self {
        for _ in 0..count {
            let index = self.devices.len();
            self.devices.push(MockDevice::new(&format!("GPU-mock-{}", index)));
        }
        self
    }

    /// Fail `init`
    pub fn with_init_error(mut self, error: NativeError) -> Self {
        self.init_error = Some(error);
        self
    }

    /// Fail `device_count`
    pub fn with_device_count_error(mut self, error: NativeError) -> Self {
        self.device_count_error = Some(error);
        self
    }

    /// Set the driver version
    pub fn with_driver_version(mut self, version: &str) -> Self {
        self.driver_version = Ok(version.to_string());
        self
    }

    /// Fail `driver_version`
    pub fn with_driver_version_error(mut self, error: NativeError) -> Self {
        self.driver_version = Err(error);
        self
    }

    /// Export only these process-list generations
    pub fn with_process_apis(mut self, apis: &[ProcessApi]) -> Self {
        self.process_apis = apis.to_vec();
        self
    }

    /// Export the versioned memory query or not
    pub fn with_memory_v2(mut self, exported: bool) -> Self {
        self.memory_v2 = exported;
        self
    }

    /// Report a different vendor library
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Counters that stay readable after the mock is moved
    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }

    fn device(&self, handle: DeviceHandle) -> NativeResult<&MockDevice> {
        handle
            .as_raw()
            .checked_sub(1)
            .and_then(|index| self.devices.get(index))
            .ok_or(NativeError::InvalidArgument)
    }
}

impl Default for MockNative {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeLibrary for MockNative {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn init(&self) -> NativeResult<()> {
        self.counters.state.init.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> NativeResult<()> {
        self.counters.state.shutdown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_function(&self, symbol: &str) -> bool {
        if symbol == "nvmlDeviceGetMemoryInfo_v2" {
            return self.memory_v2;
        }
        if symbol.contains("RunningProcesses") {
            let api = [ProcessApi::V3, ProcessApi::V2]
                .into_iter()
                .find(|api| symbol.ends_with(api.suffix()))
                .unwrap_or(ProcessApi::V1);
            return self.process_apis.contains(&api);
        }
        true
    }

    fn library_version(&self) -> NativeResult<String> {
        Ok(self.library_version.clone())
    }

    fn driver_version(&self) -> NativeResult<String> {
        self.counters.state.driver_version.fetch_add(1, Ordering::SeqCst);
        self.driver_version.clone()
    }

    fn device_count(&self) -> NativeResult<u32> {
        self.counters.state.device_count.fetch_add(1, Ordering::SeqCst);
        match &self.device_count_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.devices.len() as u32),
        }
    }

    fn handle_by_index(&self, index: u32) -> NativeResult<DeviceHandle> {
        let device = self
            .devices
            .get(index as usize)
            .ok_or(NativeError::InvalidArgument)?;
        match &device.open_error {
            Some(e) => Err(e.clone()),
            None => Ok(DeviceHandle::from_raw(index as usize + 1)),
        }
    }

    fn index(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device(device)?;
        Ok((device.as_raw() - 1) as u32)
    }

    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        let d = self.device(device)?;
        d.field(MockField::Name, d.name.clone())
    }

    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        let d = self.device(device)?;
        d.field(MockField::Uuid, d.uuid.clone())
    }

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::Temperature, d.temperature)
    }

    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::FanSpeed, d.fan_speed)
    }

    fn utilization_rates(&self, device: DeviceHandle) -> NativeResult<RawUtilization> {
        let d = self.device(device)?;
        d.field(MockField::Utilization, d.utilization)
    }

    fn encoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        let d = self.device(device)?;
        d.field(
            MockField::EncoderUtilization,
            RawCodecUtilization {
                value: d.encoder,
                sampling_period_us: 167_000,
            },
        )
    }

    fn decoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        let d = self.device(device)?;
        d.field(
            MockField::DecoderUtilization,
            RawCodecUtilization {
                value: d.decoder,
                sampling_period_us: 167_000,
            },
        )
    }

    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::PowerUsage, d.power_mw)
    }

    fn enforced_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::PowerLimit, d.power_limit_mw)
    }

    fn memory_info(&self, device: DeviceHandle, api: MemoryApi) -> NativeResult<RawMemoryInfo> {
        MockCounters::bump(&self.counters.state.memory, api);
        if api == MemoryApi::V2 && !self.memory_v2 {
            return Err(NativeError::FunctionNotFound);
        }
        let d = self.device(device)?;
        let total = d.memory_total_mb * MIB;
        let used = d.memory_used_mb * MIB;
        let reserved = d.memory_reserved_mb * MIB;
        let info = match api {
            MemoryApi::V2 => RawMemoryInfo {
                total,
                reserved: Some(reserved),
                free: total.saturating_sub(used + reserved),
                used,
            },
            MemoryApi::V1 => RawMemoryInfo {
                total,
                reserved: None,
                free: total.saturating_sub(used + reserved),
                used: used + reserved,
            },
        };
        d.field(MockField::Memory, info)
    }

    fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
        api: ProcessApi,
    ) -> NativeResult<Vec<RawProcessInfo>> {
        MockCounters::bump(&self.counters.state.process, api);
        if !self.process_apis.contains(&api) {
            return Err(NativeError::FunctionNotFound);
        }
        let d = self.device(device)?;
        match kind {
            ProcessKind::Compute => d.compute.clone(),
            ProcessKind::Graphics => d.graphics.clone(),
        }
    }

    fn clock_info(&self, device: DeviceHandle, _clock: ClockType) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::Clock, d.clock)
    }

    fn max_clock_info(&self, device: DeviceHandle, _clock: ClockType) -> NativeResult<u32> {
        let d = self.device(device)?;
        d.field(MockField::MaxClock, d.clock_max)
    }
}

/// One scripted OS process
#[derive(Debug, Clone)]
pub struct MockProcess {
    pid: u32,
    username: String,
    cmdline: Vec<String>,
    cpu_percent: f64,
    memory_percent: f64,
    denied: bool,
}

impl MockProcess {
    /// A readable process using no CPU and no memory
    pub fn new(pid: u32, username: &str, cmdline: &[&str]) -> Self {
        Self {
            pid,
            username: username.to_string(),
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            denied: false,
        }
    }

    /// CPU usage reported after the baseline read
    pub fn with_cpu_percent(mut self, percent: f64) -> Self {
        self.cpu_percent = percent;
        self
    }

    /// Resident memory as a percentage of host memory
    pub fn with_memory_percent(mut self, percent: f64) -> Self {
        self.memory_percent = percent;
        self
    }

    /// Deny every attribute read
    pub fn denied(mut self) -> Self {
        self.denied = true;
        self
    }
}

#[derive(Debug, Default)]
struct ProcessTable {
    // pid -> (generation, process)
    processes: HashMap<u32, (u64, MockProcess)>,
}

/// Shared counter readable after the owner is moved
#[derive(Debug, Clone, Default)]
pub struct MockCounter(Arc<AtomicUsize>);

impl MockCounter {
    /// Current value
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable [`ProcessInspector`]
///
/// Clones share the same table, so a test can kill or respawn processes
/// while an enricher owns another clone.
#[derive(Debug, Clone, Default)]
pub struct MockProcesses {
    table: Arc<Mutex<ProcessTable>>,
    generation: Arc<AtomicU64>,
    opens: MockCounter,
    min_cpu_window: Duration,
}

/// Host memory reported by [`MockProcesses`]
pub const MOCK_TOTAL_MEMORY: u64 = 16 * 1024 * MIB;

impl MockProcesses {
    /// Create an empty process table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a process
    pub fn with_process(self, process: MockProcess) -> Self {
        self.respawn(process);
        self
    }

    /// Reads closer together than `window` see no elapsed CPU time and
    /// report 0%, like a real tick counter sampled too soon
    pub fn with_min_cpu_window(mut self, window: Duration) -> Self {
        self.min_cpu_window = window;
        self
    }

    /// Remove a process from the table
    pub fn kill(&self, pid: u32) {
        if let Ok(mut table) = self.table.lock() {
            table.processes.remove(&pid);
        }
    }

    /// Replace whatever runs under the process' pid with a new process
    pub fn respawn(&self, process: MockProcess) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut table) = self.table.lock() {
            table.processes.insert(process.pid, (generation, process));
        }
    }

    /// Counter of successful `open` calls
    pub fn open_counter(&self) -> MockCounter {
        self.opens.clone()
    }

    fn lookup(&self, pid: u32) -> Option<(u64, MockProcess)> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.processes.get(&pid).cloned())
    }
}

impl ProcessInspector for MockProcesses {
    type Handle = MockProcessHandle;

    fn open(&self, pid: u32) -> Result<MockProcessHandle, ProcessError> {
        let (generation, _) = self.lookup(pid).ok_or(ProcessError::NoSuchProcess { pid })?;
        self.opens.bump();
        Ok(MockProcessHandle {
            pid,
            generation,
            table: self.clone(),
            last_read: None,
        })
    }

    fn pid_exists(&self, pid: u32) -> bool {
        self.lookup(pid).is_some()
    }

    fn total_memory(&self) -> Option<u64> {
        Some(MOCK_TOTAL_MEMORY)
    }
}

/// Handle into a [`MockProcesses`] table
#[derive(Debug)]
pub struct MockProcessHandle {
    pid: u32,
    generation: u64,
    table: MockProcesses,
    last_read: Option<Instant>,
}

impl MockProcessHandle {
    fn process(&self) -> Result<MockProcess, ProcessError> {
        match self.table.lookup(self.pid) {
            Some((generation, process)) if generation == self.generation => {
                if process.denied {
                    Err(ProcessError::AccessDenied { pid: self.pid })
                } else {
                    Ok(process)
                }
            }
            _ => Err(ProcessError::NoSuchProcess { pid: self.pid }),
        }
    }
}

impl ProcessHandle for MockProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        matches!(self.table.lookup(self.pid), Some((generation, _)) if generation == self.generation)
    }

    fn username(&self) -> Result<String, ProcessError> {
        Ok(self.process()?.username)
    }

    fn cmdline(&self) -> Result<Vec<String>, ProcessError> {
        Ok(self.process()?.cmdline)
    }

    fn cpu_percent(&mut self) -> Result<f64, ProcessError> {
        let process = self.process()?;
        let now = Instant::now();
        let previous = self.last_read.replace(now);
        match previous {
            Some(at) if now.duration_since(at) >= self.table.min_cpu_window => {
                Ok(process.cpu_percent)
            }
            _ => Ok(0.0),
        }
    }

    fn memory_percent(&self) -> Result<f64, ProcessError> {
        Ok(self.process()?.memory_percent)
    }
}
