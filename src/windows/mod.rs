//! Windows-specific process inspection through the Win32 API

pub mod process;

pub(crate) use process::hostname;
pub use process::{Win32Inspector, Win32Process};
