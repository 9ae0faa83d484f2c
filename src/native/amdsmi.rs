//! AMD SMI binding resolved at runtime
//!
//! Record layouts follow amdsmi 24.x as shipped with ROCm 6.2 and later.
//! Records whose trailing fields have moved between releases are read into an
//! oversized zeroed buffer and only their leading string is used.
//!
//! AMD SMI has a single process list per device, served for every
//! [`ProcessApi`] generation under [`ProcessKind::Compute`]; the graphics
//! list is always empty. Encoder and decoder utilization are not exposed.

use std::ffi::{c_char, c_uint, c_void, CStr};
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::loader::SharedLibrary;
use super::{
    Backend, ClockType, DeviceHandle, MemoryApi, NativeLibrary, ProcessApi, ProcessKind,
    RawCodecUtilization, RawMemoryInfo, RawProcessInfo, RawUtilization,
};
use crate::error::{Error, NativeError, NativeResult, Result};

type AmdSmiStatus = c_uint;
type AmdSmiHandle = *mut c_void;

const AMDSMI_STATUS_SUCCESS: AmdSmiStatus = 0;
const AMDSMI_STATUS_INVAL: AmdSmiStatus = 1;
const AMDSMI_STATUS_NOT_SUPPORTED: AmdSmiStatus = 2;
const AMDSMI_STATUS_NOT_YET_IMPLEMENTED: AmdSmiStatus = 3;
const AMDSMI_STATUS_FAIL_LOAD_MODULE: AmdSmiStatus = 4;
const AMDSMI_STATUS_FAIL_LOAD_SYMBOL: AmdSmiStatus = 5;
const AMDSMI_STATUS_NO_PERM: AmdSmiStatus = 10;
const AMDSMI_STATUS_OUT_OF_RESOURCES: AmdSmiStatus = 15;
const AMDSMI_STATUS_NOT_FOUND: AmdSmiStatus = 31;
const AMDSMI_STATUS_NOT_INIT: AmdSmiStatus = 32;
const AMDSMI_STATUS_DRIVER_NOT_LOADED: AmdSmiStatus = 34;
const AMDSMI_STATUS_INSUFFICIENT_SIZE: AmdSmiStatus = 41;
const AMDSMI_STATUS_UNKNOWN_ERROR: AmdSmiStatus = 0xFFFF_FFFF;

const AMDSMI_INIT_AMD_GPUS: u64 = 1 << 1;
const AMDSMI_TEMPERATURE_TYPE_HOTSPOT: c_uint = 1;
const AMDSMI_TEMP_CURRENT: c_uint = 0;
const AMDSMI_MEM_TYPE_VRAM: c_uint = 0;
const AMDSMI_CLK_TYPE_SYS: c_uint = 0;
const AMDSMI_CLK_TYPE_MEM: c_uint = 4;
const AMDSMI_CLK_TYPE_VCLK0: c_uint = 6;
const AMDSMI_POWER_NOT_AVAILABLE: u64 = 0xFFFF;

const AMDSMI_NORMAL_STRING_LENGTH: usize = 32;
const UUID_BUFFER_SIZE: usize = 64;
/// 4 KiB, well past the largest record read by its leading string
const RECORD_BUFFER_WORDS: usize = 512;

// Processes may start between the sizing call and the read.
const PROCESS_LIST_SLACK: u32 = 5;

#[cfg(target_os = "linux")]
const LIBRARY_CANDIDATES: &[&str] = &[
    "libamd_smi.so",
    "libamd_smi.so.24",
    "/opt/rocm/lib/libamd_smi.so",
];

#[cfg(not(target_os = "linux"))]
const LIBRARY_CANDIDATES: &[&str] = &[];

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiEngineUsage {
    gfx_activity: u32,
    umc_activity: u32,
    mm_activity: u32,
    reserved: [u32; 13],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiPowerInfo {
    current_socket_power: u64,
    average_socket_power: u64,
    gfx_voltage: u64,
    soc_voltage: u64,
    mem_voltage: u64,
    power_limit: u32,
    reserved: [u64; 18],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiClkInfo {
    clk: u32,
    min_clk: u32,
    max_clk: u32,
    clk_locked: u8,
    clk_deep_sleep: u8,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiProcEngineUsage {
    gfx: u64,
    enc: u64,
    reserved: [u32; 12],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiProcMemoryUsage {
    gtt_mem: u64,
    cpu_mem: u64,
    vram_mem: u64,
    reserved: [u32; 10],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct AmdSmiProcInfo {
    name: [c_char; AMDSMI_NORMAL_STRING_LENGTH],
    pid: u32,
    mem: u64,
    engine_usage: AmdSmiProcEngineUsage,
    memory_usage: AmdSmiProcMemoryUsage,
    container_name: [c_char; AMDSMI_NORMAL_STRING_LENGTH],
    reserved: [u32; 4],
}

type FnInit = unsafe extern "C" fn(u64) -> AmdSmiStatus;
type FnNoArgs = unsafe extern "C" fn() -> AmdSmiStatus;
type FnVersion = unsafe extern "C" fn(*mut u64) -> AmdSmiStatus;
type FnSocketHandles = unsafe extern "C" fn(*mut u32, *mut AmdSmiHandle) -> AmdSmiStatus;
type FnProcessorHandles =
    unsafe extern "C" fn(AmdSmiHandle, *mut u32, *mut AmdSmiHandle) -> AmdSmiStatus;
type FnRecord<T> = unsafe extern "C" fn(AmdSmiHandle, *mut T) -> AmdSmiStatus;
type FnUuid = unsafe extern "C" fn(AmdSmiHandle, *mut c_uint, *mut c_char) -> AmdSmiStatus;
type FnTemperature = unsafe extern "C" fn(AmdSmiHandle, c_uint, c_uint, *mut i64) -> AmdSmiStatus;
type FnFanSpeed = unsafe extern "C" fn(AmdSmiHandle, u32, *mut i64) -> AmdSmiStatus;
type FnFanSpeedMax = unsafe extern "C" fn(AmdSmiHandle, u32, *mut u64) -> AmdSmiStatus;
type FnMemory = unsafe extern "C" fn(AmdSmiHandle, c_uint, *mut u64) -> AmdSmiStatus;
type FnClock = unsafe extern "C" fn(AmdSmiHandle, c_uint, *mut AmdSmiClkInfo) -> AmdSmiStatus;
type FnProcesses = unsafe extern "C" fn(AmdSmiHandle, *mut u32, *mut AmdSmiProcInfo) -> AmdSmiStatus;

/// Map an AMD SMI status to a result
fn check(status: AmdSmiStatus) -> NativeResult<()> {
    match status {
        AMDSMI_STATUS_SUCCESS => Ok(()),
        AMDSMI_STATUS_INVAL => Err(NativeError::InvalidArgument),
        AMDSMI_STATUS_NOT_SUPPORTED | AMDSMI_STATUS_NOT_YET_IMPLEMENTED => {
            Err(NativeError::NotSupported)
        }
        AMDSMI_STATUS_FAIL_LOAD_MODULE => Err(NativeError::LibraryNotFound),
        AMDSMI_STATUS_FAIL_LOAD_SYMBOL => Err(NativeError::FunctionNotFound),
        AMDSMI_STATUS_NO_PERM => Err(NativeError::NoPermission),
        AMDSMI_STATUS_NOT_FOUND => Err(NativeError::NotFound),
        AMDSMI_STATUS_NOT_INIT => Err(NativeError::Uninitialized),
        AMDSMI_STATUS_DRIVER_NOT_LOADED => Err(NativeError::DriverNotLoaded),
        AMDSMI_STATUS_INSUFFICIENT_SIZE => Err(NativeError::InsufficientSize),
        AMDSMI_STATUS_UNKNOWN_ERROR => Err(NativeError::Unknown),
        code => Err(NativeError::Other { code }),
    }
}

/// Like [`check`], but a list call that ran out of room reports
/// `OUT_OF_RESOURCES`
fn check_list(status: AmdSmiStatus) -> NativeResult<()> {
    match status {
        AMDSMI_STATUS_OUT_OF_RESOURCES => Err(NativeError::InsufficientSize),
        status => check(status),
    }
}

fn chars_to_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// NUL-terminated string at the start of a record buffer
fn leading_string(record: &[u64]) -> String {
    let bytes: Vec<u8> = record
        .iter()
        .flat_map(|word| word.to_ne_bytes())
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Socket power in watts, falling back to the average when the current
/// reading is unsupported
fn socket_power(info: &AmdSmiPowerInfo) -> NativeResult<u64> {
    [info.current_socket_power, info.average_socket_power]
        .into_iter()
        .find(|&watts| watts != AMDSMI_POWER_NOT_AVAILABLE)
        .ok_or(NativeError::NotSupported)
}

fn watts_to_milliwatts(watts: u64) -> u32 {
    u32::try_from(watts.saturating_mul(1000)).unwrap_or(u32::MAX)
}

/// Fan speed as a percentage of the fan's maximum
fn fan_percent(speed: i64, max: u64) -> NativeResult<u32> {
    if max == 0 || speed < 0 {
        return Err(NativeError::NotSupported);
    }
    Ok(((speed as u64).saturating_mul(100) / max).min(100) as u32)
}

fn clock_domain(clock: ClockType) -> c_uint {
    match clock {
        ClockType::Graphics | ClockType::Sm => AMDSMI_CLK_TYPE_SYS,
        ClockType::Memory => AMDSMI_CLK_TYPE_MEM,
        ClockType::Video => AMDSMI_CLK_TYPE_VCLK0,
    }
}

fn raw(device: DeviceHandle) -> AmdSmiHandle {
    device.as_raw() as AmdSmiHandle
}

/// Two-call handle list read
fn read_handles<F>(mut query: F) -> NativeResult<Vec<usize>>
where
    F: FnMut(*mut u32, *mut AmdSmiHandle) -> AmdSmiStatus,
{
    let mut count: u32 = 0;
    check(query(&mut count, ptr::null_mut()))?;
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut handles: Vec<AmdSmiHandle> = vec![ptr::null_mut(); count as usize];
    check(query(&mut count, handles.as_mut_ptr()))?;
    handles.truncate(count as usize);
    Ok(handles.into_iter().map(|handle| handle as usize).collect())
}

/// Process list read: size the buffer, then fill it, retrying once if the
/// list outgrew the buffer in between
fn read_process_list(f: FnProcesses, device: AmdSmiHandle) -> NativeResult<Vec<RawProcessInfo>> {
    let mut count: u32 = 0;
    match check_list(unsafe { f(device, &mut count, ptr::null_mut()) }) {
        Ok(()) | Err(NativeError::InsufficientSize) => {}
        Err(e) => return Err(e),
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut buf = Vec::new();
    for retry in [false, true] {
        let mut capacity = count.saturating_mul(2).saturating_add(PROCESS_LIST_SLACK);
        buf.resize(capacity as usize, AmdSmiProcInfo::default());
        match check_list(unsafe { f(device, &mut capacity, buf.as_mut_ptr()) }) {
            Ok(()) => {
                buf.truncate(capacity as usize);
                return Ok(buf
                    .iter()
                    .map(|info| RawProcessInfo {
                        pid: info.pid,
                        used_gpu_memory: Some(info.mem),
                    })
                    .collect());
            }
            Err(NativeError::InsufficientSize) if !retry => count = capacity,
            Err(e) => return Err(e),
        }
    }
    Err(NativeError::InsufficientSize)
}

/// AMD SMI loaded from the system's shared library
///
/// Processor handles are enumerated once per [`device_count`] call and
/// indexed by position, the way NVML indexes devices.
///
/// [`device_count`]: NativeLibrary::device_count
pub struct AmdSmiLibrary {
    lib: SharedLibrary,
    devices: Mutex<Vec<usize>>,
}

impl AmdSmiLibrary {
    /// Load AMD SMI from the platform's default locations
    pub fn load() -> Result<Self> {
        let lib = SharedLibrary::open_first(LIBRARY_CANDIDATES)
            .map_err(|message| Error::LibraryUnavailable { message })?;
        debug!(library = lib.name(), "loaded AMD SMI");
        Ok(Self::with_library(lib))
    }

    /// Load AMD SMI from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        let lib = SharedLibrary::open_first(&[name.as_ref()])
            .map_err(|message| Error::LibraryUnavailable { message })?;
        debug!(library = lib.name(), "loaded AMD SMI");
        Ok(Self::with_library(lib))
    }

    fn with_library(lib: SharedLibrary) -> Self {
        Self {
            lib,
            devices: Mutex::new(Vec::new()),
        }
    }

    /// # Safety
    ///
    /// `F` must be the exact C signature of `symbol`.
    unsafe fn function<F: Copy>(&self, symbol: &str) -> NativeResult<F> {
        self.lib.function(symbol)
    }

    fn devices(&self) -> MutexGuard<'_, Vec<usize>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every GPU processor handle, socket by socket
    fn enumerate(&self) -> NativeResult<Vec<usize>> {
        let sockets_fn: FnSocketHandles = unsafe { self.function("amdsmi_get_socket_handles")? };
        let processors_fn: FnProcessorHandles =
            unsafe { self.function("amdsmi_get_processor_handles")? };

        let sockets = read_handles(|count, buf| unsafe { sockets_fn(count, buf) })?;
        let mut devices = Vec::new();
        for socket in sockets {
            let socket = socket as AmdSmiHandle;
            devices.extend(read_handles(|count, buf| unsafe {
                processors_fn(socket, count, buf)
            })?);
        }
        Ok(devices)
    }

    fn refresh_devices(&self) -> NativeResult<Vec<usize>> {
        let devices = self.enumerate()?;
        *self.devices() = devices.clone();
        Ok(devices)
    }

    fn known_devices(&self) -> NativeResult<Vec<usize>> {
        let cached = self.devices().clone();
        if cached.is_empty() {
            self.refresh_devices()
        } else {
            Ok(cached)
        }
    }

    fn record_string(&self, symbol: &str, device: AmdSmiHandle) -> NativeResult<String> {
        let f: FnRecord<u64> = unsafe { self.function(symbol)? };
        let mut record = vec![0u64; RECORD_BUFFER_WORDS];
        check(unsafe { f(device, record.as_mut_ptr()) })?;
        Ok(leading_string(&record))
    }

    fn record<T: Copy + Default>(&self, symbol: &str, device: DeviceHandle) -> NativeResult<T> {
        let f: FnRecord<T> = unsafe { self.function(symbol)? };
        let mut record = T::default();
        check(unsafe { f(raw(device), &mut record) })?;
        Ok(record)
    }

    fn memory(&self, symbol: &str, device: DeviceHandle) -> NativeResult<u64> {
        let f: FnMemory = unsafe { self.function(symbol)? };
        let mut bytes = 0u64;
        check(unsafe { f(raw(device), AMDSMI_MEM_TYPE_VRAM, &mut bytes) })?;
        Ok(bytes)
    }

    fn clock(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<AmdSmiClkInfo> {
        let f: FnClock = unsafe { self.function("amdsmi_get_clock_info")? };
        let mut info = AmdSmiClkInfo::default();
        check(unsafe { f(raw(device), clock_domain(clock), &mut info) })?;
        Ok(info)
    }
}

impl NativeLibrary for AmdSmiLibrary {
    fn backend(&self) -> Backend {
        Backend::AmdSmi
    }

    fn init(&self) -> NativeResult<()> {
        let f: FnInit = unsafe { self.function("amdsmi_init")? };
        check(unsafe { f(AMDSMI_INIT_AMD_GPUS) })
    }

    fn shutdown(&self) -> NativeResult<()> {
        let f: FnNoArgs = unsafe { self.function("amdsmi_shut_down")? };
        check(unsafe { f() })
    }

    fn has_function(&self, symbol: &str) -> bool {
        self.lib.resolve(symbol).is_some()
    }

    fn library_version(&self) -> NativeResult<String> {
        let f: FnVersion = unsafe { self.function("amdsmi_get_lib_version")? };
        let mut record = [0u64; 4];
        check(unsafe { f(record.as_mut_ptr()) })?;
        // `build` sits at offset 16 with or without the leading year field
        let build = record[2] as *const c_char;
        if build.is_null() {
            return Err(NativeError::NotSupported);
        }
        Ok(unsafe { CStr::from_ptr(build) }.to_string_lossy().into_owned())
    }

    fn driver_version(&self) -> NativeResult<String> {
        let first = *self.known_devices()?.first().ok_or(NativeError::NotFound)?;
        self.record_string("amdsmi_get_gpu_driver_info", first as AmdSmiHandle)
    }

    fn device_count(&self) -> NativeResult<u32> {
        Ok(self.refresh_devices()?.len() as u32)
    }

    fn handle_by_index(&self, index: u32) -> NativeResult<DeviceHandle> {
        self.known_devices()?
            .get(index as usize)
            .map(|&handle| DeviceHandle::from_raw(handle))
            .ok_or(NativeError::InvalidArgument)
    }

    fn index(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.known_devices()?
            .iter()
            .position(|&handle| handle == device.as_raw())
            .map(|position| position as u32)
            .ok_or(NativeError::NotFound)
    }

    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        self.record_string("amdsmi_get_gpu_asic_info", raw(device))
    }

    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        let f: FnUuid = unsafe { self.function("amdsmi_get_gpu_device_uuid")? };
        let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
        let mut len = buf.len() as c_uint;
        check(unsafe { f(raw(device), &mut len, buf.as_mut_ptr()) })?;
        Ok(chars_to_string(&buf))
    }

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        let f: FnTemperature = unsafe { self.function("amdsmi_get_temp_metric")? };
        let mut celsius = 0i64;
        check(unsafe {
            f(
                raw(device),
                AMDSMI_TEMPERATURE_TYPE_HOTSPOT,
                AMDSMI_TEMP_CURRENT,
                &mut celsius,
            )
        })?;
        Ok(u32::try_from(celsius.max(0)).unwrap_or(u32::MAX))
    }

    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        let speed_fn: FnFanSpeed = unsafe { self.function("amdsmi_get_gpu_fan_speed")? };
        let max_fn: FnFanSpeedMax = unsafe { self.function("amdsmi_get_gpu_fan_speed_max")? };
        let mut speed = 0i64;
        let mut max = 0u64;
        check(unsafe { speed_fn(raw(device), 0, &mut speed) })?;
        check(unsafe { max_fn(raw(device), 0, &mut max) })?;
        fan_percent(speed, max)
    }

    fn utilization_rates(&self, device: DeviceHandle) -> NativeResult<RawUtilization> {
        let usage: AmdSmiEngineUsage = self.record("amdsmi_get_gpu_activity", device)?;
        Ok(RawUtilization {
            gpu: usage.gfx_activity,
            memory: usage.umc_activity,
        })
    }

    fn encoder_utilization(&self, _device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        Err(NativeError::NotSupported)
    }

    fn decoder_utilization(&self, _device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        Err(NativeError::NotSupported)
    }

    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        let info: AmdSmiPowerInfo = self.record("amdsmi_get_power_info", device)?;
        socket_power(&info).map(watts_to_milliwatts)
    }

    fn enforced_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        let info: AmdSmiPowerInfo = self.record("amdsmi_get_power_info", device)?;
        Ok(watts_to_milliwatts(u64::from(info.power_limit)))
    }

    fn memory_info(&self, device: DeviceHandle, _api: MemoryApi) -> NativeResult<RawMemoryInfo> {
        let total = self.memory("amdsmi_get_gpu_memory_total", device)?;
        let used = self.memory("amdsmi_get_gpu_memory_usage", device)?;
        Ok(RawMemoryInfo {
            total,
            reserved: None,
            free: total.saturating_sub(used),
            used,
        })
    }

    fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
        _api: ProcessApi,
    ) -> NativeResult<Vec<RawProcessInfo>> {
        match kind {
            ProcessKind::Compute => {
                let f: FnProcesses = unsafe { self.function("amdsmi_get_gpu_process_list")? };
                read_process_list(f, raw(device))
            }
            ProcessKind::Graphics => Ok(Vec::new()),
        }
    }

    fn clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        Ok(self.clock(device, clock)?.clk)
    }

    fn max_clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        Ok(self.clock(device, clock)?.max_clk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_status_codes() {
        assert_eq!(check(AMDSMI_STATUS_SUCCESS), Ok(()));
        assert_eq!(check(AMDSMI_STATUS_NOT_YET_IMPLEMENTED), Err(NativeError::NotSupported));
        assert_eq!(check(AMDSMI_STATUS_NOT_INIT), Err(NativeError::Uninitialized));
        assert_eq!(check(AMDSMI_STATUS_UNKNOWN_ERROR), Err(NativeError::Unknown));
        assert_eq!(check(AMDSMI_STATUS_OUT_OF_RESOURCES), Err(NativeError::Other { code: 15 }));
        assert_eq!(check_list(AMDSMI_STATUS_OUT_OF_RESOURCES), Err(NativeError::InsufficientSize));
        assert_eq!(check_list(AMDSMI_STATUS_NO_PERM), Err(NativeError::NoPermission));
    }

    #[test]
    fn test_struct_layouts() {
        assert_eq!(mem::size_of::<AmdSmiEngineUsage>(), 64);
        assert_eq!(mem::size_of::<AmdSmiClkInfo>(), 32);
        assert_eq!(mem::size_of::<AmdSmiPowerInfo>(), 192);
        assert_eq!(mem::size_of::<AmdSmiProcInfo>(), 224);
    }

    #[test]
    fn test_leading_string() {
        let mut record = vec![0u64; 4];
        let text = b"AMD Instinct MI210";
        let bytes: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(record.as_mut_ptr() as *mut u8, record.len() * 8)
        };
        bytes[..text.len()].copy_from_slice(text);
        bytes[text.len() + 1] = b'x';
        assert_eq!(leading_string(&record), "AMD Instinct MI210");
    }

    #[test]
    fn test_socket_power_falls_back_to_average() {
        let mut info = AmdSmiPowerInfo {
            current_socket_power: 212,
            average_socket_power: 180,
            ..Default::default()
        };
        assert_eq!(socket_power(&info), Ok(212));
        info.current_socket_power = AMDSMI_POWER_NOT_AVAILABLE;
        assert_eq!(socket_power(&info), Ok(180));
        info.average_socket_power = AMDSMI_POWER_NOT_AVAILABLE;
        assert_eq!(socket_power(&info), Err(NativeError::NotSupported));
        assert_eq!(watts_to_milliwatts(212), 212_000);
    }

    #[test]
    fn test_fan_percent() {
        assert_eq!(fan_percent(128, 255), Ok(50));
        assert_eq!(fan_percent(300, 255), Ok(100));
        assert_eq!(fan_percent(10, 0), Err(NativeError::NotSupported));
        assert_eq!(fan_percent(-1, 255), Err(NativeError::NotSupported));
    }

    // Reports 3 processes when sized, then 16 once a buffer is offered
    unsafe extern "C" fn growing_process_list(
        _device: AmdSmiHandle,
        count: *mut u32,
        list: *mut AmdSmiProcInfo,
    ) -> AmdSmiStatus {
        const RUNNING: u32 = 16;
        if list.is_null() {
            *count = 3;
            return AMDSMI_STATUS_SUCCESS;
        }
        if *count < RUNNING {
            *count = RUNNING;
            return AMDSMI_STATUS_OUT_OF_RESOURCES;
        }
        for i in 0..RUNNING {
            *list.add(i as usize) = AmdSmiProcInfo {
                pid: 2000 + i,
                mem: 256 << 20,
                ..Default::default()
            };
        }
        *count = RUNNING;
        AMDSMI_STATUS_SUCCESS
    }

    #[test]
    fn test_process_list_grows_between_calls() {
        let processes = read_process_list(growing_process_list, ptr::null_mut()).unwrap();
        assert_eq!(processes.len(), 16);
        assert_eq!(processes[15].pid, 2015);
        assert_eq!(processes[0].used_gpu_memory, Some(256 << 20));
    }

    #[test]
    fn test_missing_library() {
        let err = AmdSmiLibrary::load_from(Path::new("/nonexistent/libamd_smi.so"))
            .err()
            .unwrap();
        assert!(err.is_initialization_failure());
    }
}
