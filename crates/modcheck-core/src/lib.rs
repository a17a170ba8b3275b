//! # modcheck-core
//!
//! The unsafe boundary of the modcheck runner: everything that touches the
//! platform dynamic loader or calls into foreign code lives here.
//!
//! # Architecture
//!
//! ```text
//! path -> ModuleLoader::load -> ModuleHandle -> resolve -> Symbol -> invoke -> InvocationResult
//!                                     |
//!                                     +-> ModuleLoader::unload (finalizers run here)
//! ```
//!
//! Load-time initializers run inside [`ModuleLoader::load`] and their stdout
//! is recorded on the loaded module. Resolved addresses never leave this
//! crate as callable values: a [`Symbol`] can only be called through
//! [`invoke`], which checks the declared [`InvocationSpec`] first.
//!
//! A misbehaving module can still crash the process. Callers that need crash
//! containment must run the module in a separate process.

#[cfg(not(unix))]
compile_error!("modcheck-core drives the platform dynamic loader and requires a unix target");

pub mod capture;
pub mod invoke;
pub mod loader;
pub mod symbol;

pub use capture::{CaptureError, Captured, capture_stdout};
pub use invoke::{
    ArgKind, InvocationResult, InvocationSpec, InvokeError, MAX_ARITY, ReturnKind, SpecError,
    Value, check_signature, invoke,
};
pub use loader::{LoadError, ModuleHandle, ModuleLoader, Teardown, UnloadError, is_path_loaded};
pub use symbol::{ResolveError, Symbol, resolve};
