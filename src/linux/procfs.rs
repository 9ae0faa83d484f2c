//! `/proc` backed process inspection
//!
//! Reads per-process metadata from procfs:
//! ```text
//! /proc/<pid>/stat     state, utime, stime, starttime
//! /proc/<pid>/status   Uid: real effective saved fs
//! /proc/<pid>/cmdline  NUL-separated argv
//! /proc/<pid>/statm    size resident shared ... (pages)
//! /proc/meminfo        MemTotal: <kB>
//! ```

use std::ffi::CStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::ProcessError;
use crate::process::{ProcessHandle, ProcessInspector};

/// CPU counters parsed from `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    state: char,
    utime: u64,
    stime: u64,
    starttime: u64,
}

/// Parse the fields of `/proc/<pid>/stat` this module needs
///
/// The command name is parenthesized and may itself contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<StatFields> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    Some(StatFields {
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        starttime: fields.get(19)?.parse().ok()?,
    })
}

/// Real UID from `/proc/<pid>/status`
fn parse_status_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

/// Split a NUL-separated argument vector
fn parse_cmdline(content: &[u8]) -> Vec<String> {
    let content = content.strip_suffix(b"\0").unwrap_or(content);
    if content.is_empty() {
        return Vec::new();
    }
    content
        .split(|&b| b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Resident pages from `/proc/<pid>/statm`
fn parse_statm_resident(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// `MemTotal` from `/proc/meminfo`, in bytes
fn parse_meminfo_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Resolve a UID to a user name through the system's user database
fn username_for_uid(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < 1 << 16 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

/// Process inspector reading a procfs mount
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
    clock_ticks: u64,
    page_size: u64,
}

impl ProcfsInspector {
    /// Inspector for the host's `/proc`
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Inspector for a procfs mounted elsewhere, such as a container's
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock_ticks: clock_ticks_per_second(),
            page_size: page_size(),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

fn read_stat(dir: &Path, pid: u32) -> Result<StatFields, ProcessError> {
    let content = fs::read_to_string(dir.join("stat")).map_err(|e| ProcessError::from_io(pid, e))?;
    parse_stat(&content).ok_or_else(|| ProcessError::Io {
        pid,
        source: io::Error::new(io::ErrorKind::InvalidData, "malformed stat"),
    })
}

impl ProcessInspector for ProcfsInspector {
    type Handle = ProcfsProcess;

    fn open(&self, pid: u32) -> Result<ProcfsProcess, ProcessError> {
        let dir = self.pid_dir(pid);
        let stat = read_stat(&dir, pid)?;
        Ok(ProcfsProcess {
            pid,
            dir,
            starttime: stat.starttime,
            clock_ticks: self.clock_ticks,
            page_size: self.page_size,
            total_memory: self.total_memory(),
            last_cpu: None,
        })
    }

    fn pid_exists(&self, pid: u32) -> bool {
        self.pid_dir(pid).exists()
    }

    fn total_memory(&self) -> Option<u64> {
        fs::read_to_string(self.root.join("meminfo"))
            .ok()
            .and_then(|content| parse_meminfo_total(&content))
    }
}

/// One process under `/proc`
#[derive(Debug)]
pub struct ProcfsProcess {
    pid: u32,
    dir: PathBuf,
    starttime: u64,
    clock_ticks: u64,
    page_size: u64,
    total_memory: Option<u64>,
    /// Wall time and CPU ticks of the previous `cpu_percent` call
    last_cpu: Option<(Instant, u64)>,
}

impl ProcfsProcess {
    fn io_err(&self, e: io::Error) -> ProcessError {
        ProcessError::from_io(self.pid, e)
    }

    /// Read stat, failing if the pid now belongs to another process
    fn current_stat(&self) -> Result<StatFields, ProcessError> {
        let stat = read_stat(&self.dir, self.pid)?;
        if stat.starttime != self.starttime {
            return Err(ProcessError::NoSuchProcess { pid: self.pid });
        }
        Ok(stat)
    }
}

impl ProcessHandle for ProcfsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        matches!(self.current_stat(), Ok(stat) if stat.state != 'Z')
    }

    fn username(&self) -> Result<String, ProcessError> {
        let status = fs::read_to_string(self.dir.join("status")).map_err(|e| self.io_err(e))?;
        let uid = parse_status_uid(&status).ok_or(ProcessError::AccessDenied { pid: self.pid })?;
        Ok(username_for_uid(uid).unwrap_or_else(|| uid.to_string()))
    }

    fn cmdline(&self) -> Result<Vec<String>, ProcessError> {
        let content = fs::read(self.dir.join("cmdline")).map_err(|e| self.io_err(e))?;
        Ok(parse_cmdline(&content))
    }

    fn cpu_percent(&mut self) -> Result<f64, ProcessError> {
        let stat = self.current_stat()?;
        let now = Instant::now();
        let ticks = stat.utime + stat.stime;

        let percent = match self.last_cpu {
            Some((then, last_ticks)) => {
                let elapsed = now.duration_since(then).as_secs_f64();
                if elapsed > 0.0 {
                    let cpu_secs = ticks.saturating_sub(last_ticks) as f64 / self.clock_ticks as f64;
                    cpu_secs / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, ticks));
        Ok(percent)
    }

    fn memory_percent(&self) -> Result<f64, ProcessError> {
        let total = self.total_memory.ok_or(ProcessError::Unsupported)?;
        let statm = fs::read_to_string(self.dir.join("statm")).map_err(|e| self.io_err(e))?;
        let pages = parse_statm_resident(&statm).ok_or(ProcessError::Unsupported)?;
        Ok((pages * self.page_size) as f64 / total as f64 * 100.0)
    }
}
