//! Session verdicts.
//!
//! A [`Verdict`] is built once at the end of a session and exposes read-only
//! accessors only. Every failure carries a [`FailureReason`] naming what went
//! wrong, so "module not found", "symbol typo" and "bad call contract" stay
//! distinguishable in reports.

use std::fmt;

use modcheck_core::{InvokeError, LoadError, ResolveError, UnloadError};
use serde::{Deserialize, Serialize};

/// Test session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loaded,
    Resolving,
    Invoking,
    Unloaded,
    Verdicted,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loaded => "loaded",
            Self::Resolving => "resolving",
            Self::Invoking => "invoking",
            Self::Unloaded => "unloaded",
            Self::Verdicted => "verdicted",
            Self::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Loaded)
                | (Self::Loaded, Self::Resolving)
                | (Self::Resolving, Self::Invoking)
                | (Self::Invoking, Self::Unloaded)
                | (Self::Unloaded, Self::Verdicted)
                | (Self::Idle, Self::Failed)
                | (Self::Loaded, Self::Failed)
                | (Self::Resolving, Self::Failed)
                | (Self::Invoking, Self::Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named cause of a failed entry or session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    ModuleNotFound { path: String },
    ModuleFormatInvalid { path: String, detail: String },
    ModuleAlreadyLoaded { path: String },
    SymbolNotFound { symbol: String },
    StaleHandle { detail: String },
    SignatureMismatch { symbol: String, detail: String },
    ExpectationFailed { expected: String, actual: String },
    CaptureFailed { detail: String },
    UnloadFailed { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModuleNotFound { path } => write!(f, "module not found: {path}"),
            Self::ModuleFormatInvalid { path, detail } => {
                write!(f, "module format invalid: {path}: {detail}")
            }
            Self::ModuleAlreadyLoaded { path } => write!(f, "module already loaded: {path}"),
            Self::SymbolNotFound { symbol } => write!(f, "symbol not found: `{symbol}`"),
            Self::StaleHandle { detail } => write!(f, "stale module handle: {detail}"),
            Self::SignatureMismatch { detail, .. } => f.write_str(detail),
            Self::ExpectationFailed { expected, actual } => {
                write!(f, "expected {expected}, got {actual}")
            }
            Self::CaptureFailed { detail } => write!(f, "stdout capture failed: {detail}"),
            Self::UnloadFailed { detail } => write!(f, "unload failed: {detail}"),
        }
    }
}

impl From<&LoadError> for FailureReason {
    fn from(err: &LoadError) -> Self {
        match err {
            LoadError::NotFound { path } => Self::ModuleNotFound {
                path: path.display().to_string(),
            },
            LoadError::FormatInvalid { path, reason } => Self::ModuleFormatInvalid {
                path: path.display().to_string(),
                detail: reason.clone(),
            },
            LoadError::AlreadyLoaded { path } => Self::ModuleAlreadyLoaded {
                path: path.display().to_string(),
            },
            LoadError::Capture(err) => Self::CaptureFailed {
                detail: err.to_string(),
            },
        }
    }
}

impl From<&ResolveError> for FailureReason {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::NotFound { name, .. } => Self::SymbolNotFound {
                symbol: name.clone(),
            },
            ResolveError::StaleHandle(stale) => Self::StaleHandle {
                detail: stale.to_string(),
            },
        }
    }
}

impl From<&InvokeError> for FailureReason {
    fn from(err: &InvokeError) -> Self {
        match err {
            InvokeError::SignatureMismatch { symbol, .. } => Self::SignatureMismatch {
                symbol: symbol.clone(),
                detail: err.to_string(),
            },
            InvokeError::Capture { .. } => Self::CaptureFailed {
                detail: err.to_string(),
            },
        }
    }
}

impl From<&UnloadError> for FailureReason {
    fn from(err: &UnloadError) -> Self {
        Self::UnloadFailed {
            detail: err.to_string(),
        }
    }
}

/// Per-entry outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Passed,
    Failed { reason: FailureReason },
    /// Optional entry whose symbol the module does not export.
    Skipped { reason: FailureReason },
    /// Never reached because the session failed first.
    NotRun,
}

impl EntryStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed { .. } => "FAIL",
            Self::Skipped { .. } => "SKIP",
            Self::NotRun => "NOT RUN",
        }
    }
}

/// Result of one expectation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVerdict {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned: Option<i32>,
    /// Stdout captured during the call (empty if the call never happened).
    #[serde(default)]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ns: Option<u64>,
}

impl EntryVerdict {
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self.status, EntryStatus::Passed)
    }

    /// Whether this entry counts against the aggregate verdict.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        match self.status {
            EntryStatus::Passed | EntryStatus::Skipped { .. } => false,
            EntryStatus::Failed { .. } => true,
            EntryStatus::NotRun => self.required,
        }
    }
}

/// Final, immutable outcome of a test session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    fixture: String,
    module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_sha256: Option<String>,
    passed: bool,
    final_state: SessionState,
    trail: Vec<SessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<FailureReason>,
    init_output: String,
    finalizer_output: String,
    entries: Vec<EntryVerdict>,
}

pub(crate) struct VerdictParts {
    pub fixture: String,
    pub module: String,
    pub module_sha256: Option<String>,
    pub trail: Vec<SessionState>,
    pub failure: Option<FailureReason>,
    pub init_output: String,
    pub finalizer_output: String,
    pub entries: Vec<EntryVerdict>,
}

impl Verdict {
    /// Seal the session's findings. The aggregate passes only if no session
    /// failure occurred and no entry counts as a failure.
    pub(crate) fn seal(parts: VerdictParts) -> Self {
        let passed = parts.failure.is_none() && !parts.entries.iter().any(EntryVerdict::is_failure);
        let final_state = parts.trail.last().copied().unwrap_or(SessionState::Idle);
        Self {
            fixture: parts.fixture,
            module: parts.module,
            module_sha256: parts.module_sha256,
            passed,
            final_state,
            trail: parts.trail,
            failure: parts.failure,
            init_output: parts.init_output,
            finalizer_output: parts.finalizer_output,
            entries: parts.entries,
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.passed
    }

    #[must_use]
    pub fn fixture(&self) -> &str {
        &self.fixture
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn module_sha256(&self) -> Option<&str> {
        self.module_sha256.as_deref()
    }

    #[must_use]
    pub fn final_state(&self) -> SessionState {
        self.final_state
    }

    /// Every state the session entered, in order.
    #[must_use]
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    /// Session-level failure (load, required resolve, signature mismatch, unload).
    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Stdout printed by load-time initializers.
    #[must_use]
    pub fn init_output(&self) -> &str {
        &self.init_output
    }

    /// Stdout printed by load-time finalizers during unload.
    #[must_use]
    pub fn finalizer_output(&self) -> &str {
        &self.finalizer_output
    }

    #[must_use]
    pub fn entries(&self) -> &[EntryVerdict] {
        &self.entries
    }

    pub fn failed_entries(&self) -> impl Iterator<Item = &EntryVerdict> {
        self.entries.iter().filter(|e| e.is_failure())
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.passed()).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed_entries().count()
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Skipped { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: EntryStatus, required: bool) -> EntryVerdict {
        EntryVerdict {
            symbol: "hello".to_string(),
            description: None,
            required,
            status,
            returned: None,
            stdout: String::new(),
            diff: None,
            latency_ns: None,
        }
    }

    fn parts(entries: Vec<EntryVerdict>, failure: Option<FailureReason>) -> VerdictParts {
        VerdictParts {
            fixture: "hello".to_string(),
            module: "/tmp/libmod_hello.so".to_string(),
            module_sha256: None,
            trail: vec![SessionState::Idle, SessionState::Verdicted],
            failure,
            init_output: String::new(),
            finalizer_output: String::new(),
            entries,
        }
    }

    #[test]
    fn legal_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition(Loaded));
        assert!(Invoking.can_transition(Failed));
        assert!(!Idle.can_transition(Invoking));
        assert!(!Verdicted.can_transition(Failed));
        assert!(!Failed.can_transition(Verdicted));
    }

    #[test]
    fn aggregate_requires_every_entry() {
        let ok = Verdict::seal(parts(vec![entry(EntryStatus::Passed, true)], None));
        assert!(ok.passed());
        assert_eq!(ok.final_state(), SessionState::Verdicted);

        let bad = Verdict::seal(parts(
            vec![
                entry(EntryStatus::Passed, true),
                entry(
                    EntryStatus::Failed {
                        reason: FailureReason::ExpectationFailed {
                            expected: "returns 5".to_string(),
                            actual: "returned 0".to_string(),
                        },
                    },
                    true,
                ),
            ],
            None,
        ));
        assert!(!bad.passed());
        assert_eq!(bad.failed_count(), 1);
        assert_eq!(bad.passed_count(), 1);
    }

    #[test]
    fn skipped_optional_entries_do_not_fail() {
        let reason = FailureReason::SymbolNotFound {
            symbol: "extra".to_string(),
        };
        let v = Verdict::seal(parts(
            vec![
                entry(EntryStatus::Passed, true),
                entry(EntryStatus::Skipped { reason }, false),
            ],
            None,
        ));
        assert!(v.passed());
        assert_eq!(v.skipped_count(), 1);
    }

    #[test]
    fn session_failure_fails_aggregate() {
        let v = Verdict::seal(parts(
            vec![entry(EntryStatus::Passed, true)],
            Some(FailureReason::UnloadFailed {
                detail: "close failed".to_string(),
            }),
        ));
        assert!(!v.passed());
    }

    #[test]
    fn failure_reasons_serialize_with_kind_tag() {
        let json = serde_json::to_value(FailureReason::ModuleNotFound {
            path: "/x.so".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "module_not_found");
        assert_eq!(json["path"], "/x.so");

        let status = serde_json::to_value(EntryStatus::NotRun).unwrap();
        assert_eq!(status["status"], "not_run");
    }
}
