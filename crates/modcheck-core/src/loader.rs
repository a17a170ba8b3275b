//! Module loading and unloading.
//!
//! A module is opened with immediate binding, so every load-time initializer
//! in the image has run (in the image's own order) by the time `load`
//! returns. Whatever those initializers print is kept on the module as its
//! init output.
//!
//! Loading the same file twice in one process would either share the mapping
//! or re-run its constructors, so canonical paths are tracked in a
//! process-wide registry: a path stays claimed from `load` until `unload`
//! (or until the owning loader is dropped).

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
use parking_lot::Mutex;

use crate::capture::{CaptureError, Captured, capture_stdout};

static LOADED_PATHS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("module not found: {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("{} is not a loadable module: {reason}", .path.display())]
    FormatInvalid { path: PathBuf, reason: String },
    #[error("{} is already loaded in this process", .path.display())]
    AlreadyLoaded { path: PathBuf },
    #[error("capturing initializer output failed: {0}")]
    Capture(#[from] CaptureError),
}

#[derive(Debug, thiserror::Error)]
pub enum UnloadError {
    #[error("{handle} is not loaded")]
    NotLoaded { handle: ModuleHandle },
    #[error("closing {} failed: {reason}", .path.display())]
    CloseFailed { path: PathBuf, reason: String },
    #[error("capturing finalizer output failed: {0}")]
    Capture(#[from] CaptureError),
}

/// A handle was used after its module was unloaded, or with the wrong loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} refers to a module that is no longer loaded")]
pub struct StaleHandle(pub ModuleHandle);

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque identifier for a module loaded by one particular [`ModuleLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    loader: u64,
    slot: u64,
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}.{}", self.loader, self.slot)
    }
}

/// What unloading a module left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub path: PathBuf,
    /// Text printed by the module's load-time finalizers.
    pub finalizer_output: String,
}

pub(crate) struct LoadedModule {
    handle: ModuleHandle,
    path: PathBuf,
    library: Library,
    init_output: String,
}

impl LoadedModule {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn library(&self) -> &Library {
        &self.library
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Sole owner of every module it loads.
///
/// Dropping the loader unloads whatever is still loaded, newest first.
pub struct ModuleLoader {
    id: u64,
    next_slot: u64,
    modules: Vec<LoadedModule>,
}

impl ModuleLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed),
            next_slot: 0,
            modules: Vec::new(),
        }
    }

    /// Map the module at `path` and run its load-time initializers.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<ModuleHandle, LoadError> {
        let requested = path.as_ref();
        let canonical = match requested.canonicalize() {
            Ok(canonical) => canonical,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    path: requested.to_path_buf(),
                });
            }
            Err(err) => {
                return Err(LoadError::FormatInvalid {
                    path: requested.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        };
        if !canonical.is_file() {
            return Err(LoadError::FormatInvalid {
                path: canonical,
                reason: "not a regular file".to_string(),
            });
        }

        if !LOADED_PATHS.lock().insert(canonical.clone()) {
            return Err(LoadError::AlreadyLoaded { path: canonical });
        }

        // SAFETY: opening a library runs its initializers. That is the point of
        // loading a fixture; the caller accepts that foreign code runs here.
        let opened = capture_stdout(|| unsafe {
            Library::open(Some(&canonical), RTLD_NOW | RTLD_LOCAL)
        });
        let (library, init_output) = match opened {
            Ok(Captured {
                value: Ok(library),
                stdout,
            }) => (library, stdout),
            Ok(Captured { value: Err(err), .. }) => {
                release_path(&canonical);
                return Err(LoadError::FormatInvalid {
                    path: canonical,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                release_path(&canonical);
                return Err(err.into());
            }
        };

        let handle = ModuleHandle {
            loader: self.id,
            slot: self.next_slot,
        };
        self.next_slot += 1;
        self.modules.push(LoadedModule {
            handle,
            path: canonical,
            library,
            init_output,
        });
        Ok(handle)
    }

    /// Run the module's finalizers and invalidate `handle`.
    ///
    /// The handle is invalid and the path released even when the platform
    /// loader reports a close failure.
    pub fn unload(&mut self, handle: ModuleHandle) -> Result<Teardown, UnloadError> {
        let index = self
            .position(handle)
            .ok_or(UnloadError::NotLoaded { handle })?;
        let LoadedModule { path, library, .. } = self.modules.remove(index);

        let closed = capture_stdout(move || library.close());
        release_path(&path);
        match closed {
            Ok(Captured {
                value: Ok(()),
                stdout,
            }) => Ok(Teardown {
                path,
                finalizer_output: stdout,
            }),
            Ok(Captured { value: Err(err), .. }) => Err(UnloadError::CloseFailed {
                path,
                reason: err.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether `handle` still refers to a module owned by this loader.
    #[must_use]
    pub fn is_loaded(&self, handle: ModuleHandle) -> bool {
        self.position(handle).is_some()
    }

    /// Canonical path the module was loaded from.
    pub fn path(&self, handle: ModuleHandle) -> Result<&Path, StaleHandle> {
        self.module(handle).map(LoadedModule::path)
    }

    /// Stdout produced by the module's load-time initializers.
    pub fn init_output(&self, handle: ModuleHandle) -> Result<&str, StaleHandle> {
        self.module(handle).map(|module| module.init_output.as_str())
    }

    /// Number of modules currently loaded through this loader.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.modules.len()
    }

    pub(crate) fn module(&self, handle: ModuleHandle) -> Result<&LoadedModule, StaleHandle> {
        self.position(handle)
            .map(|index| &self.modules[index])
            .ok_or(StaleHandle(handle))
    }

    fn position(&self, handle: ModuleHandle) -> Option<usize> {
        if handle.loader != self.id {
            return None;
        }
        self.modules.iter().position(|m| m.handle == handle)
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        while let Some(handle) = self.modules.last().map(|m| m.handle) {
            let _ = self.unload(handle);
        }
    }
}

/// Whether `path` is currently claimed by any loader in this process.
#[must_use]
pub fn is_path_loaded(path: impl AsRef<Path>) -> bool {
    match path.as_ref().canonicalize() {
        Ok(canonical) => LOADED_PATHS.lock().contains(&canonical),
        Err(_) => false,
    }
}

fn release_path(path: &Path) {
    LOADED_PATHS.lock().remove(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "modcheck-loader-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_path_is_not_found() {
        let mut loader = ModuleLoader::new();
        let err = loader
            .load("/nonexistent/modcheck/libnothing.so")
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }), "{err}");
    }

    #[test]
    fn garbage_file_is_format_invalid_and_released() {
        let path = scratch_file("garbage.so", b"definitely not an ELF image");
        let mut loader = ModuleLoader::new();
        let err = loader.load(&path).unwrap_err();
        assert!(matches!(err, LoadError::FormatInvalid { .. }), "{err}");
        assert!(!is_path_loaded(&path), "failed load must not keep the path claimed");
        assert_eq!(loader.loaded_count(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn directory_is_format_invalid() {
        let mut loader = ModuleLoader::new();
        let err = loader.load(std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, LoadError::FormatInvalid { .. }), "{err}");
    }

    #[test]
    fn unknown_handle_is_not_loaded() {
        let mut a = ModuleLoader::new();
        let b = ModuleLoader::new();
        let foreign = ModuleHandle {
            loader: b.id,
            slot: 0,
        };
        assert!(!a.is_loaded(foreign));
        assert!(matches!(
            a.unload(foreign),
            Err(UnloadError::NotLoaded { .. })
        ));
        assert_eq!(a.init_output(foreign), Err(StaleHandle(foreign)));
    }

    #[test]
    fn handle_display_names_loader_and_slot() {
        let handle = ModuleHandle { loader: 3, slot: 9 };
        assert_eq!(handle.to_string(), "module#3.9");
    }
}
