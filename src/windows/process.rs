//! Win32 process inspection
//!
//! Per-process data comes from a `PROCESS_QUERY_LIMITED_INFORMATION` handle:
//! image path, creation/kernel/user times, the working set and the owner of
//! the process token. Reading the
//! real argument vector would require walking the target's PEB, so the image
//! path stands in for argv.

use std::io;
use std::time::Instant;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, E_ACCESSDENIED, FILETIME, HANDLE};
use windows::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, SID_NAME_USE, TOKEN_QUERY, TOKEN_USER,
};
use windows::Win32::System::ProcessStatus::{K32GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::SystemInformation::{
    ComputerNameDnsHostname, GetComputerNameExW, GlobalMemoryStatusEx, MEMORYSTATUSEX,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessTimes, OpenProcess, OpenProcessToken, QueryFullProcessImageNameW,
    PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};

use crate::error::ProcessError;
use crate::process::{ProcessHandle, ProcessInspector};

const STILL_ACTIVE: u32 = 259;
const MAX_PATH_WIDE: usize = 32768;
const ACCOUNT_NAME_WIDE: usize = 256;
/// FILETIME ticks per second (100 ns units)
const FILETIME_TICKS: f64 = 10_000_000.0;

fn filetime_to_u64(ft: FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

fn io_error(pid: u32, e: windows::core::Error) -> ProcessError {
    if e.code() == E_ACCESSDENIED {
        ProcessError::AccessDenied { pid }
    } else {
        ProcessError::Io {
            pid,
            source: io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

/// `DOMAIN\user` owning an access token
fn token_account(token: HANDLE) -> windows::core::Result<String> {
    let mut size = 0u32;
    // sizing call; fails with ERROR_INSUFFICIENT_BUFFER
    let _ = unsafe { GetTokenInformation(token, TokenUser, None, 0, &mut size) };
    // u64 storage keeps TOKEN_USER aligned
    let mut buf = vec![0u64; (size as usize).div_ceil(8)];
    unsafe { GetTokenInformation(token, TokenUser, Some(buf.as_mut_ptr().cast()), size, &mut size) }?;
    let user = unsafe { &*(buf.as_ptr() as *const TOKEN_USER) };

    let mut name = [0u16; ACCOUNT_NAME_WIDE];
    let mut name_len = name.len() as u32;
    let mut domain = [0u16; ACCOUNT_NAME_WIDE];
    let mut domain_len = domain.len() as u32;
    let mut kind = SID_NAME_USE::default();
    unsafe {
        LookupAccountSidW(
            PCWSTR::null(),
            user.User.Sid,
            PWSTR(name.as_mut_ptr()),
            &mut name_len,
            PWSTR(domain.as_mut_ptr()),
            &mut domain_len,
            &mut kind,
        )
    }?;

    let name = String::from_utf16_lossy(&name[..name_len as usize]);
    let domain = String::from_utf16_lossy(&domain[..domain_len as usize]);
    if domain.is_empty() {
        Ok(name)
    } else {
        Ok(format!("{}\\{}", domain, name))
    }
}

/// DNS host name of this machine
pub(crate) fn hostname() -> Option<String> {
    let mut buf = vec![0u16; 256];
    let mut size = buf.len() as u32;
    unsafe { GetComputerNameExW(ComputerNameDnsHostname, PWSTR(buf.as_mut_ptr()), &mut size) }.ok()?;
    Some(String::from_utf16_lossy(&buf[..size as usize]))
}

/// Process inspector backed by the Win32 API
#[derive(Debug, Clone, Default)]
pub struct Win32Inspector;

impl Win32Inspector {
    /// Create an inspector
    pub fn new() -> Self {
        Self
    }
}

impl ProcessInspector for Win32Inspector {
    type Handle = Win32Process;

    fn open(&self, pid: u32) -> Result<Win32Process, ProcessError> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }.map_err(|e| {
            if e.code() == E_ACCESSDENIED {
                ProcessError::AccessDenied { pid }
            } else {
                ProcessError::NoSuchProcess { pid }
            }
        })?;
        let mut process = Win32Process {
            pid,
            handle,
            created: 0,
            total_memory: self.total_memory(),
            last_cpu: None,
        };
        process.created = process.times()?.0;
        Ok(process)
    }

    fn pid_exists(&self, pid: u32) -> bool {
        match self.open(pid) {
            Ok(process) => process.is_running(),
            Err(e) => !e.is_vanished(),
        }
    }

    fn total_memory(&self) -> Option<u64> {
        let mut status = MEMORYSTATUSEX {
            dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
            ..Default::default()
        };
        unsafe { GlobalMemoryStatusEx(&mut status) }.ok()?;
        Some(status.ullTotalPhys)
    }
}

/// An open Win32 process handle, closed on drop
#[derive(Debug)]
pub struct Win32Process {
    pid: u32,
    handle: HANDLE,
    created: u64,
    total_memory: Option<u64>,
    last_cpu: Option<(Instant, u64)>,
}

// A process handle may be used from any thread.
unsafe impl Send for Win32Process {}

impl Win32Process {
    /// Creation time and kernel+user CPU time, in FILETIME ticks
    fn times(&self) -> Result<(u64, u64), ProcessError> {
        let mut created = FILETIME::default();
        let mut exited = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe { GetProcessTimes(self.handle, &mut created, &mut exited, &mut kernel, &mut user) }
            .map_err(|e| io_error(self.pid, e))?;
        Ok((
            filetime_to_u64(created),
            filetime_to_u64(kernel) + filetime_to_u64(user),
        ))
    }

    fn image_path(&self) -> Result<String, ProcessError> {
        let mut buf = vec![0u16; MAX_PATH_WIDE];
        let mut size = buf.len() as u32;
        unsafe {
            QueryFullProcessImageNameW(self.handle, PROCESS_NAME_WIN32, PWSTR(buf.as_mut_ptr()), &mut size)
        }
        .map_err(|e| io_error(self.pid, e))?;
        Ok(String::from_utf16_lossy(&buf[..size as usize]))
    }

    fn owner(&self) -> Result<String, ProcessError> {
        let mut token = HANDLE::default();
        unsafe { OpenProcessToken(self.handle, TOKEN_QUERY, &mut token) }
            .map_err(|e| io_error(self.pid, e))?;
        let account = token_account(token).map_err(|e| io_error(self.pid, e));
        let _ = unsafe { CloseHandle(token) };
        account
    }

    fn ensure_running(&self) -> Result<(), ProcessError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ProcessError::NoSuchProcess { pid: self.pid })
        }
    }
}

impl Drop for Win32Process {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.handle) };
    }
}

impl ProcessHandle for Win32Process {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        let mut code = 0u32;
        let alive = unsafe { GetExitCodeProcess(self.handle, &mut code) }.is_ok() && code == STILL_ACTIVE;
        alive && matches!(self.times(), Ok((created, _)) if created == self.created)
    }

    fn username(&self) -> Result<String, ProcessError> {
        self.ensure_running()?;
        self.owner()
    }

    fn cmdline(&self) -> Result<Vec<String>, ProcessError> {
        self.ensure_running()?;
        Ok(vec![self.image_path()?])
    }

    fn cpu_percent(&mut self) -> Result<f64, ProcessError> {
        self.ensure_running()?;
        let (_, busy) = self.times()?;
        let now = Instant::now();

        let percent = match self.last_cpu {
            Some((then, last_busy)) => {
                let elapsed = now.duration_since(then).as_secs_f64();
                if elapsed > 0.0 {
                    busy.saturating_sub(last_busy) as f64 / FILETIME_TICKS / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, busy));
        Ok(percent)
    }

    fn memory_percent(&self) -> Result<f64, ProcessError> {
        self.ensure_running()?;
        let total = self.total_memory.ok_or(ProcessError::Unsupported)?;
        let mut counters = PROCESS_MEMORY_COUNTERS {
            cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            ..Default::default()
        };
        let ok = unsafe { K32GetProcessMemoryInfo(self.handle, &mut counters, counters.cb) };
        if !ok.as_bool() {
            return Err(ProcessError::AccessDenied { pid: self.pid });
        }
        Ok(counters.WorkingSetSize as f64 / total as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_to_u64() {
        let ft = FILETIME {
            dwLowDateTime: 1,
            dwHighDateTime: 2,
        };
        assert_eq!(filetime_to_u64(ft), (2u64 << 32) | 1);
    }

    #[test]
    fn test_inspect_self() {
        let inspector = Win32Inspector::new();
        let pid = std::process::id();
        let mut handle = inspector.open(pid).unwrap();
        assert!(handle.is_running());
        assert!(handle.cmdline().unwrap()[0].ends_with(".exe"));
        assert_eq!(handle.cpu_percent().unwrap(), 0.0);
        assert!(handle.memory_percent().unwrap() > 0.0);
        assert!(inspector.total_memory().unwrap() > 0);
    }

    #[test]
    fn test_username_of_self() {
        let handle = Win32Inspector::new().open(std::process::id()).unwrap();
        let username = handle.username().unwrap();
        let (domain, user) = username.split_once('\\').unwrap();
        assert!(!domain.is_empty());
        assert!(!user.is_empty());
    }
}
