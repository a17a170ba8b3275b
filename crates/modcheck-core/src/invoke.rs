//! Typed invocation of resolved entry points.
//!
//! Calls go through a closed set of C types: `int` arguments, byte-buffer
//! pointers, and an `int` or `void` return. The declared [`InvocationSpec`] is
//! checked against the supplied [`Value`]s before anything is called; a call
//! with the wrong arity or argument types is refused, never attempted.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureError, capture_stdout};
use crate::symbol::Symbol;

/// Largest number of arguments an entry point may declare.
pub const MAX_ARITY: usize = 4;

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    /// `int32_t`.
    I32,
    /// Pointer to a NUL-terminated byte buffer.
    Bytes,
    /// `(void)`: only valid as the sole entry of an argument list.
    Void,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::I32 => "i32",
            Self::Bytes => "bytes",
            Self::Void => "void",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    I32,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("`void` must be the only argument kind, got ({})", render_kinds(.0))]
    VoidNotAlone(Vec<ArgKind>),
    #[error("{0} arguments declared, at most {max} are supported", max = MAX_ARITY)]
    TooManyArguments(usize),
}

/// Declared signature of an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSpec", into = "RawSpec")]
pub struct InvocationSpec {
    params: Vec<ArgKind>,
    returns: ReturnKind,
}

#[derive(Serialize, Deserialize)]
struct RawSpec {
    #[serde(default)]
    args: Vec<ArgKind>,
    returns: ReturnKind,
}

impl TryFrom<RawSpec> for InvocationSpec {
    type Error = SpecError;

    fn try_from(raw: RawSpec) -> Result<Self, Self::Error> {
        Self::new(raw.args, raw.returns)
    }
}

impl From<InvocationSpec> for RawSpec {
    fn from(spec: InvocationSpec) -> Self {
        Self {
            args: spec.params,
            returns: spec.returns,
        }
    }
}

impl InvocationSpec {
    /// Build a spec, normalizing `(void)` to an empty parameter list.
    pub fn new(args: impl Into<Vec<ArgKind>>, returns: ReturnKind) -> Result<Self, SpecError> {
        let args = args.into();
        let params = match args.as_slice() {
            [ArgKind::Void] => Vec::new(),
            kinds if kinds.contains(&ArgKind::Void) => return Err(SpecError::VoidNotAlone(args)),
            _ => args,
        };
        if params.len() > MAX_ARITY {
            return Err(SpecError::TooManyArguments(params.len()));
        }
        Ok(Self { params, returns })
    }

    /// `int f(void)`.
    #[must_use]
    pub fn nullary() -> Self {
        Self {
            params: Vec::new(),
            returns: ReturnKind::I32,
        }
    }

    /// `int f(int, ...)` with `arity` int parameters.
    pub fn ints(arity: usize) -> Result<Self, SpecError> {
        Self::new(vec![ArgKind::I32; arity], ReturnKind::I32)
    }

    #[must_use]
    pub fn params(&self) -> &[ArgKind] {
        &self.params
    }

    #[must_use]
    pub fn returns(&self) -> ReturnKind {
        self.returns
    }
}

impl fmt::Display for InvocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ret = match self.returns {
            ReturnKind::I32 => "i32",
            ReturnKind::None => "void",
        };
        write!(f, "({}) -> {ret}", render_kinds(&self.params))
    }
}

// ---------------------------------------------------------------------------
// Values and results
// ---------------------------------------------------------------------------

/// An argument passed to an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    I32(i32),
    /// Passed as a pointer to a NUL-terminated copy of these bytes.
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }

    #[must_use]
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::I32(_) => ArgKind::I32,
            Self::Bytes(_) => ArgKind::Bytes,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

/// Outcome of one call into a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub symbol: String,
    /// `None` when the signature declares a `void` return.
    pub returned: Option<i32>,
    /// Everything written to stdout during the call.
    pub stdout: String,
    /// Always true for a returned result; a crashing call takes the process down.
    pub completed: bool,
    pub elapsed_ns: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(
        "signature mismatch calling `{symbol}`: declared ({}), supplied ({})",
        render_kinds(.declared),
        render_kinds(.supplied)
    )]
    SignatureMismatch {
        symbol: String,
        declared: Vec<ArgKind>,
        supplied: Vec<ArgKind>,
    },
    #[error("capturing output of `{symbol}` failed: {source}")]
    Capture {
        symbol: String,
        #[source]
        source: CaptureError,
    },
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Call `symbol` as `spec` with `args`, capturing its stdout.
///
/// The call runs synchronously on the calling thread and blocks until the
/// foreign code returns. Return values are passed through uninterpreted.
pub fn invoke(
    symbol: &Symbol<'_>,
    spec: &InvocationSpec,
    args: &[Value],
) -> Result<InvocationResult, InvokeError> {
    check_signature(symbol.name(), spec, args)?;

    let mut buffers: Vec<Vec<u8>> = args
        .iter()
        .filter_map(|value| match value {
            Value::Bytes(bytes) => {
                let mut buf = Vec::with_capacity(bytes.len() + 1);
                buf.extend_from_slice(bytes);
                buf.push(0);
                Some(buf)
            }
            Value::I32(_) => None,
        })
        .collect();
    let mut next_buffer = buffers.iter_mut();
    let raw: Vec<RawArg> = args
        .iter()
        .map(|value| match value {
            Value::I32(v) => RawArg::I32(*v),
            Value::Bytes(_) => RawArg::Ptr(
                next_buffer
                    .next()
                    .map_or(std::ptr::null_mut(), |buf| buf.as_mut_ptr()),
            ),
        })
        .collect();

    let address = symbol.address();
    let returns = spec.returns();
    let started = Instant::now();
    // SAFETY: `raw` matches `spec` (checked above) and the byte buffers stay
    // alive in `buffers` until after the call. Whether `spec` matches the
    // foreign definition is the caller's contract.
    let captured = capture_stdout(|| unsafe { call(address, returns, &raw) }).map_err(|source| {
        InvokeError::Capture {
            symbol: symbol.name().to_string(),
            source,
        }
    })?;
    let elapsed_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
    drop(buffers);

    let returned = captured.value.ok_or_else(|| mismatch(symbol.name(), spec, args))?;
    Ok(InvocationResult {
        symbol: symbol.name().to_string(),
        returned,
        stdout: captured.stdout,
        completed: true,
        elapsed_ns,
    })
}

/// Check `args` against `spec` without calling anything.
pub fn check_signature(
    symbol: &str,
    spec: &InvocationSpec,
    args: &[Value],
) -> Result<(), InvokeError> {
    let agrees = spec.params().len() == args.len()
        && spec
            .params()
            .iter()
            .zip(args)
            .all(|(kind, value)| *kind == value.kind());
    if agrees {
        Ok(())
    } else {
        Err(mismatch(symbol, spec, args))
    }
}

fn mismatch(symbol: &str, spec: &InvocationSpec, args: &[Value]) -> InvokeError {
    InvokeError::SignatureMismatch {
        symbol: symbol.to_string(),
        declared: spec.params().to_vec(),
        supplied: args.iter().map(Value::kind).collect(),
    }
}

fn render_kinds(kinds: &[ArgKind]) -> String {
    if kinds.is_empty() {
        return "void".to_string();
    }
    kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------
//
// Each argument is peeled off the slice and fixed to a concrete Rust type one
// level at a time, so the final call site sees a fully typed `extern "C" fn`.
// Every level returns `None` instead of calling when the slice is longer than
// MAX_ARITY.

#[derive(Clone, Copy)]
enum RawArg {
    I32(i32),
    Ptr(*mut u8),
}

unsafe fn call(
    address: NonNull<c_void>,
    returns: ReturnKind,
    args: &[RawArg],
) -> Option<Option<i32>> {
    let address = address.as_ptr();
    // SAFETY: forwarded from `invoke`.
    unsafe {
        match returns {
            ReturnKind::I32 => dispatch0::<i32>(address, args).map(Some),
            ReturnKind::None => dispatch0::<()>(address, args).map(|()| None),
        }
    }
}

unsafe fn dispatch0<R>(f: *mut c_void, args: &[RawArg]) -> Option<R> {
    // SAFETY: each arm reinterprets `f` with exactly the argument types in `args`.
    unsafe {
        match args {
            [] => {
                let f: unsafe extern "C" fn() -> R = std::mem::transmute_copy(&f);
                Some(f())
            }
            [RawArg::I32(a), rest @ ..] => dispatch1(f, *a, rest),
            [RawArg::Ptr(a), rest @ ..] => dispatch1(f, *a, rest),
        }
    }
}

unsafe fn dispatch1<R, A>(f: *mut c_void, a: A, args: &[RawArg]) -> Option<R> {
    // SAFETY: as in `dispatch0`.
    unsafe {
        match args {
            [] => {
                let f: unsafe extern "C" fn(A) -> R = std::mem::transmute_copy(&f);
                Some(f(a))
            }
            [RawArg::I32(b), rest @ ..] => dispatch2(f, a, *b, rest),
            [RawArg::Ptr(b), rest @ ..] => dispatch2(f, a, *b, rest),
        }
    }
}

unsafe fn dispatch2<R, A, B>(f: *mut c_void, a: A, b: B, args: &[RawArg]) -> Option<R> {
    // SAFETY: as in `dispatch0`.
    unsafe {
        match args {
            [] => {
                let f: unsafe extern "C" fn(A, B) -> R = std::mem::transmute_copy(&f);
                Some(f(a, b))
            }
            [RawArg::I32(c), rest @ ..] => dispatch3(f, a, b, *c, rest),
            [RawArg::Ptr(c), rest @ ..] => dispatch3(f, a, b, *c, rest),
        }
    }
}

unsafe fn dispatch3<R, A, B, C>(f: *mut c_void, a: A, b: B, c: C, args: &[RawArg]) -> Option<R> {
    // SAFETY: as in `dispatch0`.
    unsafe {
        match args {
            [] => {
                let f: unsafe extern "C" fn(A, B, C) -> R = std::mem::transmute_copy(&f);
                Some(f(a, b, c))
            }
            [RawArg::I32(d)] => {
                let f: unsafe extern "C" fn(A, B, C, i32) -> R = std::mem::transmute_copy(&f);
                Some(f(a, b, c, *d))
            }
            [RawArg::Ptr(d)] => {
                let f: unsafe extern "C" fn(A, B, C, *mut u8) -> R = std::mem::transmute_copy(&f);
                Some(f(a, b, c, *d))
            }
            _ => None,
        }
    }
}
