//! Native fixture modules for modcheck tests.
//!
//! `mod_hello` is a small C++ module. A global object prints
//! `static_constructor` when the module loads and `static_destructor` when it
//! unloads. The entry points listed in [`HELLO_EXPORTS`] have C linkage. It
//! also defines `hidden_helper` with hidden visibility and `mangled_only` with
//! C++ linkage; neither may resolve by its plain name.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};

const HELLO_MODULE: &str = env!("MODCHECK_HELLO_MODULE");

/// Entry points `mod_hello` exports with C linkage.
pub const HELLO_EXPORTS: &[&str] = &["hello", "test", "test2", "init_count", "greet", "touch"];

/// Path of the compiled `mod_hello` shared object, if a C++ compiler was available.
#[must_use]
pub fn hello_module() -> Option<&'static Path> {
    if HELLO_MODULE.is_empty() {
        None
    } else {
        Some(Path::new(HELLO_MODULE))
    }
}

static EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Serialize tests that load fixture modules.
///
/// A module path can only be loaded once per process at a time, so tests in
/// one binary that load the same fixture must not overlap.
pub fn exclusive() -> MutexGuard<'static, ()> {
    EXCLUSIVE.lock()
}
