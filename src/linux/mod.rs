//! Linux-specific process inspection through procfs

pub mod procfs;

use std::ffi::CStr;

pub use procfs::{ProcfsInspector, ProcfsProcess};

/// Host name from `gethostname(2)`
pub(crate) fn hostname() -> Option<String> {
    let mut buf = [0 as libc::c_char; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    // POSIX leaves truncation unterminated
    buf[buf.len() - 1] = 0;
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
