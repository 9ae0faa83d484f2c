//! NVML binding resolved at runtime
//!
//! The library is loaded with the platform loader and every entry point is
//! looked up by symbol name, so one build works against any driver release.
//! A symbol the loaded library does not export surfaces as
//! [`NativeError::FunctionNotFound`].

use std::ffi::{c_char, c_uint, c_void};
use std::mem;
use std::path::Path;
use std::ptr;

use tracing::debug;

use super::loader::SharedLibrary;
use super::{
    Backend, ClockType, DeviceHandle, MemoryApi, NativeLibrary, ProcessApi, ProcessKind,
    RawCodecUtilization, RawMemoryInfo, RawProcessInfo, RawUtilization,
};
use crate::error::{Error, NativeError, NativeResult, Result};

type NvmlReturn = c_uint;
type NvmlDevice = *mut c_void;

const NVML_SUCCESS: NvmlReturn = 0;
const NVML_ERROR_UNINITIALIZED: NvmlReturn = 1;
const NVML_ERROR_INVALID_ARGUMENT: NvmlReturn = 2;
const NVML_ERROR_NOT_SUPPORTED: NvmlReturn = 3;
const NVML_ERROR_NO_PERMISSION: NvmlReturn = 4;
const NVML_ERROR_NOT_FOUND: NvmlReturn = 6;
const NVML_ERROR_INSUFFICIENT_SIZE: NvmlReturn = 7;
const NVML_ERROR_DRIVER_NOT_LOADED: NvmlReturn = 9;
const NVML_ERROR_LIBRARY_NOT_FOUND: NvmlReturn = 12;
const NVML_ERROR_FUNCTION_NOT_FOUND: NvmlReturn = 13;
const NVML_ERROR_GPU_IS_LOST: NvmlReturn = 15;
const NVML_ERROR_UNKNOWN: NvmlReturn = 999;

const NVML_TEMPERATURE_GPU: c_uint = 0;
const NVML_VALUE_NOT_AVAILABLE: u64 = u64::MAX;

const SYSTEM_VERSION_BUFFER_SIZE: usize = 80;
const DEVICE_NAME_BUFFER_SIZE: usize = 96;
const DEVICE_UUID_BUFFER_SIZE: usize = 96;

// Processes may start between the sizing call and the read.
const PROCESS_LIST_SLACK: c_uint = 5;

#[cfg(target_os = "linux")]
const LIBRARY_CANDIDATES: &[&str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];

#[cfg(target_os = "windows")]
const LIBRARY_CANDIDATES: &[&str] = &[
    "nvml.dll",
    "C:\\Windows\\System32\\nvml.dll",
    "C:\\Program Files\\NVIDIA Corporation\\NVSMI\\nvml.dll",
];

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
const LIBRARY_CANDIDATES: &[&str] = &[];

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NvmlUtilization {
    gpu: c_uint,
    memory: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NvmlMemoryV1 {
    total: u64,
    free: u64,
    used: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct NvmlMemoryV2 {
    version: c_uint,
    total: u64,
    reserved: u64,
    free: u64,
    used: u64,
}

// nvmlMemory_v2 = NVML_STRUCT_VERSION(Memory, 2)
const NVML_MEMORY_V2: c_uint = mem::size_of::<NvmlMemoryV2>() as c_uint | (2 << 24);

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NvmlProcessInfoV1 {
    pid: c_uint,
    used_gpu_memory: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct NvmlProcessInfoV2 {
    pid: c_uint,
    used_gpu_memory: u64,
    gpu_instance_id: c_uint,
    compute_instance_id: c_uint,
}

trait ProcessInfoLayout: Copy + Default {
    fn to_raw(&self) -> RawProcessInfo;
}

impl ProcessInfoLayout for NvmlProcessInfoV1 {
    fn to_raw(&self) -> RawProcessInfo {
        RawProcessInfo {
            pid: self.pid,
            used_gpu_memory: gpu_memory(self.used_gpu_memory),
        }
    }
}

impl ProcessInfoLayout for NvmlProcessInfoV2 {
    fn to_raw(&self) -> RawProcessInfo {
        RawProcessInfo {
            pid: self.pid,
            used_gpu_memory: gpu_memory(self.used_gpu_memory),
        }
    }
}

fn gpu_memory(value: u64) -> Option<u64> {
    if value == NVML_VALUE_NOT_AVAILABLE {
        None
    } else {
        Some(value)
    }
}

type FnNoArgs = unsafe extern "C" fn() -> NvmlReturn;
type FnSystemString = unsafe extern "C" fn(*mut c_char, c_uint) -> NvmlReturn;
type FnCount = unsafe extern "C" fn(*mut c_uint) -> NvmlReturn;
type FnHandleByIndex = unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> NvmlReturn;
type FnDeviceU32 = unsafe extern "C" fn(NvmlDevice, *mut c_uint) -> NvmlReturn;
type FnDeviceString = unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn;
type FnDeviceSelectU32 = unsafe extern "C" fn(NvmlDevice, c_uint, *mut c_uint) -> NvmlReturn;
type FnUtilization = unsafe extern "C" fn(NvmlDevice, *mut NvmlUtilization) -> NvmlReturn;
type FnCodec = unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut c_uint) -> NvmlReturn;
type FnMemoryV1 = unsafe extern "C" fn(NvmlDevice, *mut NvmlMemoryV1) -> NvmlReturn;
type FnMemoryV2 = unsafe extern "C" fn(NvmlDevice, *mut NvmlMemoryV2) -> NvmlReturn;
type FnProcesses<T> = unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut T) -> NvmlReturn;

/// Map an NVML return code to a result
fn check(ret: NvmlReturn) -> NativeResult<()> {
    match ret {
        NVML_SUCCESS => Ok(()),
        NVML_ERROR_UNINITIALIZED => Err(NativeError::Uninitialized),
        NVML_ERROR_INVALID_ARGUMENT => Err(NativeError::InvalidArgument),
        NVML_ERROR_NOT_SUPPORTED => Err(NativeError::NotSupported),
        NVML_ERROR_NO_PERMISSION => Err(NativeError::NoPermission),
        NVML_ERROR_NOT_FOUND => Err(NativeError::NotFound),
        NVML_ERROR_INSUFFICIENT_SIZE => Err(NativeError::InsufficientSize),
        NVML_ERROR_DRIVER_NOT_LOADED => Err(NativeError::DriverNotLoaded),
        NVML_ERROR_LIBRARY_NOT_FOUND => Err(NativeError::LibraryNotFound),
        NVML_ERROR_FUNCTION_NOT_FOUND => Err(NativeError::FunctionNotFound),
        NVML_ERROR_GPU_IS_LOST => Err(NativeError::GpuIsLost),
        NVML_ERROR_UNKNOWN => Err(NativeError::Unknown),
        code => Err(NativeError::Other { code }),
    }
}

fn buffer_to_string(buf: &[c_char]) -> String {
    // NVML always NUL-terminates on success; guard against a full buffer anyway
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// NVML loaded from the system's shared library
pub struct NvmlLibrary {
    lib: SharedLibrary,
}

impl NvmlLibrary {
    /// Load NVML from the platform's default locations
    pub fn load() -> Result<Self> {
        let lib = SharedLibrary::open_first(LIBRARY_CANDIDATES)
            .map_err(|message| Error::LibraryUnavailable { message })?;
        debug!(library = lib.name(), "loaded NVML");
        Ok(Self { lib })
    }

    /// Load NVML from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        let lib = SharedLibrary::open_first(&[name.as_ref()])
            .map_err(|message| Error::LibraryUnavailable { message })?;
        debug!(library = lib.name(), "loaded NVML");
        Ok(Self { lib })
    }

    /// # Safety
    ///
    /// `F` must be the exact C signature of `symbol`.
    unsafe fn function<F: Copy>(&self, symbol: &str) -> NativeResult<F> {
        self.lib.function(symbol)
    }

    /// First of `symbols` that resolves
    unsafe fn function_any<F: Copy>(&self, symbols: &[&str]) -> NativeResult<F> {
        for symbol in symbols {
            if let Ok(f) = self.function::<F>(symbol) {
                return Ok(f);
            }
        }
        Err(NativeError::FunctionNotFound)
    }

    fn system_string(&self, symbol: &str) -> NativeResult<String> {
        let f: FnSystemString = unsafe { self.function(symbol)? };
        let mut buf = [0 as c_char; SYSTEM_VERSION_BUFFER_SIZE];
        check(unsafe { f(buf.as_mut_ptr(), buf.len() as c_uint) })?;
        Ok(buffer_to_string(&buf))
    }

    fn device_string<const N: usize>(&self, symbol: &str, device: DeviceHandle) -> NativeResult<String> {
        let f: FnDeviceString = unsafe { self.function(symbol)? };
        let mut buf = [0 as c_char; N];
        check(unsafe { f(raw(device), buf.as_mut_ptr(), N as c_uint) })?;
        Ok(buffer_to_string(&buf))
    }

    fn device_u32(&self, symbol: &str, device: DeviceHandle) -> NativeResult<u32> {
        let f: FnDeviceU32 = unsafe { self.function(symbol)? };
        let mut value: c_uint = 0;
        check(unsafe { f(raw(device), &mut value) })?;
        Ok(value)
    }

    fn device_select_u32(&self, symbol: &str, device: DeviceHandle, selector: c_uint) -> NativeResult<u32> {
        let f: FnDeviceSelectU32 = unsafe { self.function(symbol)? };
        let mut value: c_uint = 0;
        check(unsafe { f(raw(device), selector, &mut value) })?;
        Ok(value)
    }

    fn codec(&self, symbol: &str, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        let f: FnCodec = unsafe { self.function(symbol)? };
        let mut value: c_uint = 0;
        let mut period: c_uint = 0;
        check(unsafe { f(raw(device), &mut value, &mut period) })?;
        Ok(RawCodecUtilization {
            value,
            sampling_period_us: period,
        })
    }
}

fn raw(device: DeviceHandle) -> NvmlDevice {
    device.as_raw() as NvmlDevice
}

/// Process list read: size the buffer, then fill it
///
/// A list that outgrows the buffer between the calls is retried once with
/// the count the library reported.
fn read_process_list<T: ProcessInfoLayout>(
    f: FnProcesses<T>,
    device: DeviceHandle,
) -> NativeResult<Vec<RawProcessInfo>> {
    let mut count: c_uint = 0;
    match check(unsafe { f(raw(device), &mut count, ptr::null_mut()) }) {
        Ok(()) => return Ok(Vec::new()),
        Err(NativeError::InsufficientSize) => {}
        Err(e) => return Err(e),
    }

    let mut buf = Vec::new();
    for retry in [false, true] {
        let mut capacity = count.saturating_mul(2).saturating_add(PROCESS_LIST_SLACK);
        buf.resize(capacity as usize, T::default());
        match check(unsafe { f(raw(device), &mut capacity, buf.as_mut_ptr()) }) {
            Ok(()) => {
                buf.truncate(capacity as usize);
                return Ok(buf.iter().map(T::to_raw).collect());
            }
            Err(NativeError::InsufficientSize) if !retry => count = capacity,
            Err(e) => return Err(e),
        }
    }
    Err(NativeError::InsufficientSize)
}

impl NativeLibrary for NvmlLibrary {
    fn backend(&self) -> Backend {
        Backend::Nvml
    }

    fn init(&self) -> NativeResult<()> {
        let f: FnNoArgs = unsafe { self.function_any(&["nvmlInit_v2", "nvmlInit"])? };
        check(unsafe { f() })
    }

    fn shutdown(&self) -> NativeResult<()> {
        let f: FnNoArgs = unsafe { self.function("nvmlShutdown")? };
        check(unsafe { f() })
    }

    fn has_function(&self, symbol: &str) -> bool {
        self.lib.resolve(symbol).is_some()
    }

    fn library_version(&self) -> NativeResult<String> {
        self.system_string("nvmlSystemGetNVMLVersion")
    }

    fn driver_version(&self) -> NativeResult<String> {
        self.system_string("nvmlSystemGetDriverVersion")
    }

    fn device_count(&self) -> NativeResult<u32> {
        let f: FnCount =
            unsafe { self.function_any(&["nvmlDeviceGetCount_v2", "nvmlDeviceGetCount"])? };
        let mut count: c_uint = 0;
        check(unsafe { f(&mut count) })?;
        Ok(count)
    }

    fn handle_by_index(&self, index: u32) -> NativeResult<DeviceHandle> {
        let f: FnHandleByIndex = unsafe {
            self.function_any(&["nvmlDeviceGetHandleByIndex_v2", "nvmlDeviceGetHandleByIndex"])?
        };
        let mut device: NvmlDevice = ptr::null_mut();
        check(unsafe { f(index, &mut device) })?;
        Ok(DeviceHandle::from_raw(device as usize))
    }

    fn index(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device_u32("nvmlDeviceGetIndex", device)
    }

    fn name(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device_string::<DEVICE_NAME_BUFFER_SIZE>("nvmlDeviceGetName", device)
    }

    fn uuid(&self, device: DeviceHandle) -> NativeResult<String> {
        self.device_string::<DEVICE_UUID_BUFFER_SIZE>("nvmlDeviceGetUUID", device)
    }

    fn temperature(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device_select_u32("nvmlDeviceGetTemperature", device, NVML_TEMPERATURE_GPU)
    }

    fn fan_speed(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device_u32("nvmlDeviceGetFanSpeed", device)
    }

    fn utilization_rates(&self, device: DeviceHandle) -> NativeResult<RawUtilization> {
        let f: FnUtilization = unsafe { self.function("nvmlDeviceGetUtilizationRates")? };
        let mut util = NvmlUtilization::default();
        check(unsafe { f(raw(device), &mut util) })?;
        Ok(RawUtilization {
            gpu: util.gpu,
            memory: util.memory,
        })
    }

    fn encoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        self.codec("nvmlDeviceGetEncoderUtilization", device)
    }

    fn decoder_utilization(&self, device: DeviceHandle) -> NativeResult<RawCodecUtilization> {
        self.codec("nvmlDeviceGetDecoderUtilization", device)
    }

    fn power_usage(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device_u32("nvmlDeviceGetPowerUsage", device)
    }

    fn enforced_power_limit(&self, device: DeviceHandle) -> NativeResult<u32> {
        self.device_u32("nvmlDeviceGetEnforcedPowerLimit", device)
    }

    fn memory_info(&self, device: DeviceHandle, api: MemoryApi) -> NativeResult<RawMemoryInfo> {
        match api {
            MemoryApi::V1 => {
                let f: FnMemoryV1 = unsafe { self.function("nvmlDeviceGetMemoryInfo")? };
                let mut mem = NvmlMemoryV1::default();
                check(unsafe { f(raw(device), &mut mem) })?;
                Ok(RawMemoryInfo {
                    total: mem.total,
                    reserved: None,
                    free: mem.free,
                    used: mem.used,
                })
            }
            MemoryApi::V2 => {
                let f: FnMemoryV2 = unsafe { self.function("nvmlDeviceGetMemoryInfo_v2")? };
                let mut mem = NvmlMemoryV2 {
                    version: NVML_MEMORY_V2,
                    ..Default::default()
                };
                check(unsafe { f(raw(device), &mut mem) })?;
                Ok(RawMemoryInfo {
                    total: mem.total,
                    reserved: Some(mem.reserved),
                    free: mem.free,
                    used: mem.used,
                })
            }
        }
    }

    fn running_processes(
        &self,
        device: DeviceHandle,
        kind: ProcessKind,
        api: ProcessApi,
    ) -> NativeResult<Vec<RawProcessInfo>> {
        let base = match kind {
            ProcessKind::Compute => "nvmlDeviceGetComputeRunningProcesses",
            ProcessKind::Graphics => "nvmlDeviceGetGraphicsRunningProcesses",
        };
        let symbol = format!("{}{}", base, api.suffix());
        match api {
            ProcessApi::V1 => {
                let f: FnProcesses<NvmlProcessInfoV1> = unsafe { self.function(&symbol)? };
                read_process_list(f, device)
            }
            ProcessApi::V2 | ProcessApi::V3 => {
                let f: FnProcesses<NvmlProcessInfoV2> = unsafe { self.function(&symbol)? };
                read_process_list(f, device)
            }
        }
    }

    fn clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        self.device_select_u32("nvmlDeviceGetClockInfo", device, clock as c_uint)
    }

    fn max_clock_info(&self, device: DeviceHandle, clock: ClockType) -> NativeResult<u32> {
        self.device_select_u32("nvmlDeviceGetMaxClockInfo", device, clock as c_uint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        assert_eq!(check(NVML_SUCCESS), Ok(()));
        assert_eq!(check(NVML_ERROR_GPU_IS_LOST), Err(NativeError::GpuIsLost));
        assert_eq!(
            check(NVML_ERROR_FUNCTION_NOT_FOUND),
            Err(NativeError::FunctionNotFound)
        );
        assert_eq!(check(42), Err(NativeError::Other { code: 42 }));
    }

    #[test]
    fn test_struct_layouts() {
        assert_eq!(mem::size_of::<NvmlMemoryV1>(), 24);
        assert_eq!(mem::size_of::<NvmlMemoryV2>(), 40);
        assert_eq!(NVML_MEMORY_V2, 40 | (2 << 24));
        assert_eq!(mem::size_of::<NvmlProcessInfoV1>(), 16);
        assert_eq!(mem::size_of::<NvmlProcessInfoV2>(), 24);
    }

    #[test]
    fn test_buffer_to_string() {
        let mut buf = [0 as c_char; 8];
        for (dst, src) in buf.iter_mut().zip(b"535.86") {
            *dst = *src as c_char;
        }
        assert_eq!(buffer_to_string(&buf), "535.86");
    }

    // Reports 2 processes when sized, then 20 by the time the buffer is read
    unsafe extern "C" fn growing_process_list(
        _device: NvmlDevice,
        count: *mut c_uint,
        infos: *mut NvmlProcessInfoV1,
    ) -> NvmlReturn {
        const RUNNING: c_uint = 20;
        if infos.is_null() {
            *count = 2;
            return NVML_ERROR_INSUFFICIENT_SIZE;
        }
        if *count < RUNNING {
            *count = RUNNING;
            return NVML_ERROR_INSUFFICIENT_SIZE;
        }
        for i in 0..RUNNING {
            *infos.add(i as usize) = NvmlProcessInfoV1 {
                pid: 1000 + i,
                used_gpu_memory: 1 << 20,
            };
        }
        *count = RUNNING;
        NVML_SUCCESS
    }

    #[test]
    fn test_process_list_grows_between_calls() {
        let f: FnProcesses<NvmlProcessInfoV1> = growing_process_list;
        let processes = read_process_list(f, DeviceHandle::from_raw(0x10)).unwrap();
        assert_eq!(processes.len(), 20);
        assert_eq!(processes[0].pid, 1000);
        assert_eq!(processes[19].pid, 1019);
        assert_eq!(processes[19].used_gpu_memory, Some(1 << 20));
    }

    #[test]
    fn test_unavailable_gpu_memory() {
        let info = NvmlProcessInfoV1 {
            pid: 10,
            used_gpu_memory: NVML_VALUE_NOT_AVAILABLE,
        };
        assert_eq!(info.to_raw().used_gpu_memory, None);
    }
}
