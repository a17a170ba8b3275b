//! Exported symbol resolution.
//!
//! Lookup goes through the platform loader's symbol search for the module's
//! handle, which also walks the module's dependencies. A hit only counts if
//! `dladdr` attributes the address to the module's own image, so libc's
//! `printf` is not "exported" by a module that merely links against libc.

use std::ffi::{CStr, OsStr, c_void};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::loader::{ModuleHandle, ModuleLoader, StaleHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("symbol `{name}` is not exported by {}", .module.display())]
    NotFound { name: String, module: PathBuf },
    #[error(transparent)]
    StaleHandle(#[from] StaleHandle),
}

/// A resolved entry point.
///
/// Borrows the loader, so the module cannot be unloaded while the symbol is
/// alive. The address is only reachable through [`crate::invoke`].
pub struct Symbol<'m> {
    name: String,
    module: ModuleHandle,
    address: NonNull<c_void>,
    _loader: PhantomData<&'m ModuleLoader>,
}

impl Symbol<'_> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn module(&self) -> ModuleHandle {
        self.module
    }

    pub(crate) fn address(&self) -> NonNull<c_void> {
        self.address
    }
}

impl fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("address", &self.address)
            .finish()
    }
}

/// Look up `name` among the exported symbols of the module behind `handle`.
///
/// Matching is exact and case-sensitive. Resolution has no side effects and
/// never re-runs initializers, so resolving the same name twice yields the
/// same address.
pub fn resolve<'m>(
    loader: &'m ModuleLoader,
    handle: ModuleHandle,
    name: &str,
) -> Result<Symbol<'m>, ResolveError> {
    let module = loader.module(handle)?;
    let not_found = || ResolveError::NotFound {
        name: name.to_string(),
        module: module.path().to_path_buf(),
    };

    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(not_found());
    }

    // SAFETY: the symbol is read as an opaque address and never dereferenced here.
    let raw = match unsafe { module.library().get::<*mut c_void>(name.as_bytes()) } {
        Ok(symbol) => *symbol,
        Err(_) => return Err(not_found()),
    };
    let address = NonNull::new(raw).ok_or_else(not_found)?;
    if !defined_in(address, module.path()) {
        return Err(not_found());
    }

    Ok(Symbol {
        name: name.to_string(),
        module: handle,
        address,
        _loader: PhantomData,
    })
}

impl ModuleLoader {
    /// Shorthand for [`resolve`] against this loader.
    pub fn resolve(&self, handle: ModuleHandle, name: &str) -> Result<Symbol<'_>, ResolveError> {
        resolve(self, handle, name)
    }
}

fn defined_in(address: NonNull<c_void>, image: &Path) -> bool {
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: dladdr only inspects the address and writes into `info`.
    let found = unsafe { libc::dladdr(address.as_ptr().cast_const(), info.as_mut_ptr()) };
    if found == 0 {
        return false;
    }
    // SAFETY: dladdr reported success, so `info` is filled in; zeroed pointers are valid too.
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return false;
    }
    // SAFETY: dli_fname points at the loader's NUL-terminated copy of the object name.
    let fname = unsafe { CStr::from_ptr(info.dli_fname) };
    let fname = Path::new(OsStr::from_bytes(fname.to_bytes()));
    fname == image || fname.canonicalize().is_ok_and(|p| p == image)
}
