//! Runtime symbol resolution.
//!
//! The async-select primitives are looked up by name when the manager
//! initializes instead of being linked statically, so an application that
//! never touches sockets carries no hard dependency on them.

use crate::error::{Error, Result};

use std::ffi::{CString, c_void};
use std::mem;

/// A loaded shared library (or the running process image).
///
/// Dropping it releases the module; function pointers obtained from
/// [`symbol`](Self::symbol) must not outlive it.
pub struct DynamicLibrary {
    handle: *mut c_void,
    name: String,
}

unsafe impl Send for DynamicLibrary {}
unsafe impl Sync for DynamicLibrary {}

impl DynamicLibrary {
    /// Name the library was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up `symbol` and reinterprets it as `T`.
    ///
    /// # Safety
    ///
    /// `T` must be a function pointer type whose signature matches the
    /// exported symbol, and the returned value must not be used after
    /// this library is dropped.
    pub unsafe fn symbol<T: Copy>(&self, symbol: &str) -> Result<T> {
        assert_eq!(
            mem::size_of::<T>(),
            mem::size_of::<*mut c_void>(),
            "symbol type must be pointer sized"
        );

        let c_name = CString::new(symbol).map_err(|e| self.error(symbol, e.to_string()))?;
        let address = unsafe { self.lookup(&c_name) }.map_err(|reason| self.error(symbol, reason))?;

        Ok(unsafe { mem::transmute_copy(&address) })
    }

    fn error(&self, symbol: &str, reason: String) -> Error {
        Error::Library {
            library: self.name.clone(),
            symbol: symbol.to_string(),
            reason,
        }
    }
}

#[cfg(unix)]
impl DynamicLibrary {
    /// Opens the shared library `name` with `dlopen(3)`.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|e| Error::Library {
            library: name.to_string(),
            symbol: String::new(),
            reason: e.to_string(),
        })?;

        Self::dlopen(c_name.as_ptr(), name)
    }

    /// Handle to the symbols already loaded into the running process.
    pub fn process() -> Result<Self> {
        Self::dlopen(std::ptr::null(), "<process>")
    }

    fn dlopen(path: *const std::ffi::c_char, name: &str) -> Result<Self> {
        let handle = unsafe { libc::dlopen(path, libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::Library {
                library: name.to_string(),
                symbol: String::new(),
                reason: last_dl_error(),
            });
        }

        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    unsafe fn lookup(&self, symbol: &CString) -> std::result::Result<*mut c_void, String> {
        unsafe {
            libc::dlerror();
            let address = libc::dlsym(self.handle, symbol.as_ptr());

            if address.is_null() {
                Err(last_dl_error())
            } else {
                Ok(address)
            }
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown loader error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(unix)]
impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(windows)]
impl DynamicLibrary {
    /// Loads the module `name` with `LoadLibraryW`.
    pub fn open(name: &str) -> Result<Self> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Foundation::GetLastError;
        use windows_sys::Win32::System::LibraryLoader::LoadLibraryW;

        let wide: Vec<u16> = OsStr::new(name)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(Error::Library {
                library: name.to_string(),
                symbol: String::new(),
                reason: format!("error code {code}"),
            });
        }

        Ok(Self {
            handle: handle as *mut c_void,
            name: name.to_string(),
        })
    }

    unsafe fn lookup(&self, symbol: &CString) -> std::result::Result<*mut c_void, String> {
        use windows_sys::Win32::Foundation::GetLastError;
        use windows_sys::Win32::System::LibraryLoader::GetProcAddress;

        match unsafe { GetProcAddress(self.handle as _, symbol.as_ptr() as *const u8) } {
            Some(address) => Ok(address as *mut c_void),
            None => Err(format!("error code {}", unsafe { GetLastError() })),
        }
    }
}

#[cfg(windows)]
impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::FreeLibrary(self.handle as _);
        }
    }
}
