//! Runtime loading of the vendor shared library
//!
//! Entry points are resolved by name so that a library missing a newer
//! symbol still loads; the caller decides what a missing symbol means.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::mem;
use std::sync::Mutex;

use crate::error::{NativeError, NativeResult};

/// A dynamically loaded shared library
pub(crate) struct SharedLibrary {
    handle: *mut c_void,
    name: String,
    /// Resolved entry points by symbol; `None` records a missing symbol
    symbols: Mutex<HashMap<String, Option<usize>>>,
}

// The module handle is process-global and the loader APIs are thread-safe.
unsafe impl Send for SharedLibrary {}

impl SharedLibrary {
    /// Load the first library in `candidates` that can be opened
    pub(crate) fn open_first(candidates: &[&str]) -> Result<Self, String> {
        let mut failures = Vec::new();
        for candidate in candidates {
            match Self::open(candidate) {
                Ok(lib) => return Ok(lib),
                Err(e) => failures.push(format!("{}: {}", candidate, e)),
            }
        }
        Err(failures.join("; "))
    }

    fn new(handle: *mut c_void, name: &str) -> Self {
        Self {
            handle,
            name: name.to_string(),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Name the library was opened with
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn open(name: &str) -> Result<Self, String> {
        let c_name = CString::new(name).map_err(|e| e.to_string())?;
        let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(last_dl_error());
        }
        Ok(Self::new(handle, name))
    }

    #[cfg(windows)]
    fn open(name: &str) -> Result<Self, String> {
        use windows::core::PCWSTR;
        use windows::Win32::System::LibraryLoader::LoadLibraryW;

        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let module = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }.map_err(|e| e.to_string())?;
        Ok(Self::new(module.0, name))
    }

    #[cfg(not(any(unix, windows)))]
    fn open(_name: &str) -> Result<Self, String> {
        Err("dynamic loading is not supported on this platform".to_string())
    }

    /// Address of an exported symbol, cached after the first lookup
    pub(crate) fn resolve(&self, symbol: &str) -> Option<usize> {
        let mut symbols = match self.symbols.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = symbols.get(symbol) {
            return *cached;
        }
        let resolved = self.symbol(symbol).map(|p| p as usize);
        symbols.insert(symbol.to_string(), resolved);
        resolved
    }

    /// Look up an entry point and reinterpret it as the function type `F`
    ///
    /// # Safety
    ///
    /// `F` must be the exact C signature of `symbol`.
    pub(crate) unsafe fn function<F: Copy>(&self, symbol: &str) -> NativeResult<F> {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        let addr = self.resolve(symbol).ok_or(NativeError::FunctionNotFound)?;
        Ok(mem::transmute_copy::<usize, F>(&addr))
    }

    /// Resolve an exported symbol, or `None` if the library does not export it
    fn symbol(&self, symbol: &str) -> Option<*const c_void> {
        let c_symbol = CString::new(symbol).ok()?;
        let ptr = self.raw_symbol(&c_symbol);
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    #[cfg(unix)]
    fn raw_symbol(&self, symbol: &CString) -> *const c_void {
        unsafe { libc::dlsym(self.handle, symbol.as_ptr()) as *const c_void }
    }

    #[cfg(windows)]
    fn raw_symbol(&self, symbol: &CString) -> *const c_void {
        use windows::core::PCSTR;
        use windows::Win32::Foundation::HMODULE;
        use windows::Win32::System::LibraryLoader::GetProcAddress;

        let proc = unsafe { GetProcAddress(HMODULE(self.handle), PCSTR(symbol.as_ptr() as *const u8)) };
        match proc {
            Some(f) => f as *const c_void,
            None => std::ptr::null(),
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn raw_symbol(&self, _symbol: &CString) -> *const c_void {
        std::ptr::null()
    }
}

impl Drop for SharedLibrary {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle);
        }

        #[cfg(windows)]
        unsafe {
            use windows::Win32::Foundation::{FreeLibrary, HMODULE};
            let _ = FreeLibrary(HMODULE(self.handle));
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(msg) }
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let err = SharedLibrary::open_first(&["libdefinitely-not-here-gpu-telemetry.so.9"])
            .err()
            .unwrap();
        assert!(err.contains("libdefinitely-not-here-gpu-telemetry.so.9"));
    }
}
