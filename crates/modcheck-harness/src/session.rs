//! Test sessions: load one fixture, exercise its entry points, unload, judge.
//!
//! ```text
//! Idle -> Loaded -> Resolving -> Invoking -> Unloaded -> Verdicted
//!   \________\___________\___________\______________-> Failed
//! ```
//!
//! Every symbol is resolved before anything is called, so a typo in a
//! required name fails the session without running any foreign code beyond
//! the module's initializers. A failed session still unloads the module.

use std::path::{Path, PathBuf};
use std::time::Instant;

use modcheck_core::{InvokeError, ModuleHandle, ModuleLoader, Symbol};

use crate::expectation::ExpectationSet;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use crate::verdict::{EntryStatus, EntryVerdict, FailureReason, SessionState, Verdict, VerdictParts};

/// One fixture, one expectation set, one run.
pub struct TestSession<'a> {
    module: PathBuf,
    expectations: ExpectationSet,
    progress: Progress<'a>,
}

/// State trail plus the optional log sink.
struct Progress<'a> {
    fixture: String,
    log: Option<&'a mut LogEmitter>,
    state: SessionState,
    trail: Vec<SessionState>,
}

impl Progress<'_> {
    fn enter(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal session transition {} -> {next}",
            self.state
        );
        self.state = next;
        self.trail.push(next);
    }

    /// Best-effort: a log write failure never changes the verdict.
    fn log(&mut self, entry: LogEntry) {
        if let Some(log) = self.log.as_deref_mut() {
            let _ = log.emit_entry(
                entry
                    .with_fixture(&self.fixture)
                    .with_state(self.state.as_str()),
            );
        }
    }
}

impl<'a> TestSession<'a> {
    #[must_use]
    pub fn new(module: impl Into<PathBuf>, expectations: ExpectationSet) -> Self {
        Self {
            module: module.into(),
            progress: Progress {
                fixture: expectations.fixture.clone(),
                log: None,
                state: SessionState::Idle,
                trail: vec![SessionState::Idle],
            },
            expectations,
        }
    }

    /// Emit session events to `log`.
    #[must_use]
    pub fn with_log(mut self, log: &'a mut LogEmitter) -> Self {
        self.progress.log = Some(log);
        self
    }

    /// Drive the session to a verdict. Consumes the session.
    #[must_use]
    pub fn run(mut self) -> Verdict {
        let started = Instant::now();
        let fixture = self.expectations.fixture.clone();
        if let Some(log) = self.progress.log.as_deref_mut() {
            log.set_session(&fixture);
        }
        self.progress.log(
            LogEntry::new("", LogLevel::Info, "session_start")
                .with_module(self.module.display().to_string())
                .with_details(serde_json::json!({ "entries": self.expectations.entries.len() })),
        );

        let mut entries: Vec<EntryVerdict> = self
            .expectations
            .entries
            .iter()
            .map(|e| EntryVerdict {
                symbol: e.symbol.clone(),
                description: e.description.clone(),
                required: e.required,
                status: EntryStatus::NotRun,
                returned: None,
                stdout: String::new(),
                diff: None,
                latency_ns: None,
            })
            .collect();
        let module_sha256 = sha256_hex(&self.module);

        let mut loader = ModuleLoader::new();
        let handle = match loader.load(&self.module) {
            Ok(handle) => handle,
            Err(err) => {
                let reason = FailureReason::from(&err);
                let module = self.module.display().to_string();
                self.progress.enter(SessionState::Failed);
                self.progress.log(
                    LogEntry::new("", LogLevel::Error, "module_load_failed")
                        .with_module(module.clone())
                        .with_outcome(Outcome::Error)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                );
                return self.finish(
                    started,
                    VerdictParts {
                        fixture,
                        module,
                        module_sha256,
                        trail: Vec::new(),
                        failure: Some(reason),
                        init_output: String::new(),
                        finalizer_output: String::new(),
                        entries,
                    },
                );
            }
        };

        let module = loader
            .path(handle)
            .map_or_else(|_| self.module.clone(), Path::to_path_buf)
            .display()
            .to_string();
        let init_output = loader.init_output(handle).unwrap_or_default().to_string();
        self.progress.enter(SessionState::Loaded);
        self.progress.log(
            LogEntry::new("", LogLevel::Info, "module_loaded")
                .with_module(module.clone())
                .with_details(serde_json::json!({ "init_output": init_output })),
        );

        let mut failure = self.exercise(&loader, handle, &mut entries);

        let finalizer_output = match loader.unload(handle) {
            Ok(teardown) => {
                if failure.is_none() {
                    self.progress.enter(SessionState::Unloaded);
                }
                self.progress.log(
                    LogEntry::new("", LogLevel::Info, "module_unloaded")
                        .with_module(module.clone())
                        .with_details(
                            serde_json::json!({ "finalizer_output": teardown.finalizer_output }),
                        ),
                );
                teardown.finalizer_output
            }
            Err(err) => {
                self.progress.log(
                    LogEntry::new("", LogLevel::Error, "module_unload_failed")
                        .with_module(module.clone())
                        .with_outcome(Outcome::Error)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                );
                if failure.is_none() {
                    failure = Some(FailureReason::from(&err));
                    self.progress.enter(SessionState::Failed);
                }
                String::new()
            }
        };
        if failure.is_none() {
            self.progress.enter(SessionState::Verdicted);
        }

        self.finish(
            started,
            VerdictParts {
                fixture,
                module,
                module_sha256,
                trail: Vec::new(),
                failure,
                init_output,
                finalizer_output,
                entries,
            },
        )
    }

    /// Resolve every entry, then call them in order.
    ///
    /// Returns the session-level failure, if any. Symbols borrow `loader`, so
    /// they are all gone by the time the caller unloads.
    fn exercise(
        &mut self,
        loader: &ModuleLoader,
        handle: ModuleHandle,
        entries: &mut [EntryVerdict],
    ) -> Option<FailureReason> {
        self.progress.enter(SessionState::Resolving);
        let mut symbols: Vec<Option<Symbol<'_>>> = Vec::with_capacity(entries.len());
        for (expectation, verdict) in self.expectations.entries.iter().zip(entries.iter_mut()) {
            match loader.resolve(handle, &expectation.symbol) {
                Ok(symbol) => {
                    self.progress.log(
                        LogEntry::new("", LogLevel::Debug, "symbol_resolved")
                            .with_symbol(&expectation.symbol),
                    );
                    symbols.push(Some(symbol));
                }
                Err(err) if !expectation.required => {
                    verdict.status = EntryStatus::Skipped {
                        reason: FailureReason::from(&err),
                    };
                    symbols.push(None);
                }
                Err(err) => {
                    let reason = FailureReason::from(&err);
                    verdict.status = EntryStatus::Failed {
                        reason: reason.clone(),
                    };
                    self.progress.enter(SessionState::Failed);
                    self.progress.log(
                        LogEntry::new("", LogLevel::Error, "symbol_not_found")
                            .with_symbol(&expectation.symbol)
                            .with_outcome(Outcome::Fail)
                            .with_details(serde_json::json!({ "error": err.to_string() })),
                    );
                    return Some(reason);
                }
            }
        }

        self.progress.enter(SessionState::Invoking);
        for (index, symbol) in symbols.iter().enumerate() {
            let Some(symbol) = symbol else { continue };
            let expectation = &self.expectations.entries[index];
            let verdict = &mut entries[index];
            match modcheck_core::invoke(symbol, &expectation.spec, &expectation.args) {
                Ok(result) => {
                    verdict.returned = result.returned;
                    verdict.latency_ns = Some(result.elapsed_ns);
                    let outcome = match expectation.expect.evaluate(&result) {
                        Ok(()) => {
                            verdict.status = EntryStatus::Passed;
                            Outcome::Pass
                        }
                        Err(mismatch) => {
                            verdict.diff = mismatch.diff;
                            verdict.status = EntryStatus::Failed {
                                reason: FailureReason::ExpectationFailed {
                                    expected: mismatch.expected,
                                    actual: mismatch.actual,
                                },
                            };
                            Outcome::Fail
                        }
                    };
                    verdict.stdout = result.stdout;
                    let mut entry = LogEntry::new(
                        "",
                        if outcome == Outcome::Pass {
                            LogLevel::Info
                        } else {
                            LogLevel::Warn
                        },
                        "entry_result",
                    )
                    .with_symbol(&expectation.symbol)
                    .with_outcome(outcome)
                    .with_latency_ns(result.elapsed_ns);
                    if let Some(value) = result.returned {
                        entry = entry.with_return_value(value);
                    }
                    self.progress.log(entry);
                }
                Err(err) => {
                    let reason = FailureReason::from(&err);
                    verdict.status = EntryStatus::Failed {
                        reason: reason.clone(),
                    };
                    self.progress.enter(SessionState::Failed);
                    let event = match err {
                        InvokeError::SignatureMismatch { .. } => "signature_mismatch",
                        InvokeError::Capture { .. } => "capture_failed",
                    };
                    self.progress.log(
                        LogEntry::new("", LogLevel::Error, event)
                            .with_symbol(&expectation.symbol)
                            .with_outcome(Outcome::Error)
                            .with_details(serde_json::json!({ "error": err.to_string() })),
                    );
                    return Some(reason);
                }
            }
        }
        None
    }

    fn finish(mut self, started: Instant, mut parts: VerdictParts) -> Verdict {
        parts.trail = std::mem::take(&mut self.progress.trail);
        let verdict = Verdict::seal(parts);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.progress.log(
            LogEntry::new(
                "",
                if verdict.passed() {
                    LogLevel::Info
                } else {
                    LogLevel::Error
                },
                "verdict",
            )
            .with_module(verdict.module())
            .with_outcome(if verdict.passed() {
                Outcome::Pass
            } else {
                Outcome::Fail
            })
            .with_duration_ms(duration_ms)
            .with_details(serde_json::json!({
                "passed": verdict.passed_count(),
                "failed": verdict.failed_count(),
                "skipped": verdict.skipped_count(),
                "failure": verdict.failure().map(ToString::to_string),
            })),
        );
        if let Some(log) = self.progress.log.as_deref_mut() {
            let _ = log.flush();
        }
        verdict
    }
}

/// Run `expectations` against the module at `module` without logging.
#[must_use]
pub fn run_session(module: impl AsRef<Path>, expectations: ExpectationSet) -> Verdict {
    TestSession::new(module.as_ref(), expectations).run()
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// SHA-256 of the module file, if it can be read.
fn sha256_hex(path: &Path) -> Option<String> {
    use sha2::Digest;
    let data = std::fs::read(path).ok()?;
    Some(hex_lower(&sha2::Sha256::digest(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::{Expectation, Predicate};
    use modcheck_core::InvocationSpec;

    #[test]
    fn missing_module_fails_before_loading() {
        let set = ExpectationSet::new(
            "ghost",
            vec![Expectation::new(
                "hello",
                InvocationSpec::ints(1).unwrap(),
                vec![0.into()],
                Predicate::Returns(0),
            )],
        );
        let mut log = LogEmitter::to_buffer("unit");
        let verdict = TestSession::new("/nonexistent/modcheck/libghost.so", set)
            .with_log(&mut log)
            .run();

        assert!(!verdict.passed());
        assert_eq!(verdict.final_state(), SessionState::Failed);
        assert_eq!(verdict.trail(), [SessionState::Idle, SessionState::Failed]);
        assert!(matches!(
            verdict.failure(),
            Some(FailureReason::ModuleNotFound { .. })
        ));
        assert!(verdict.module_sha256().is_none());
        assert_eq!(verdict.entries()[0].status, EntryStatus::NotRun);

        let lines = log.buffered_lines();
        assert!(lines.first().is_some_and(|l| l.contains("session_start")));
        assert!(lines.last().is_some_and(|l| l.contains("\"verdict\"")));
        assert!(lines.iter().all(|l| l.contains("ghost::")));
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let path = std::env::temp_dir().join(format!("modcheck-digest-{}", std::process::id()));
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_hex(&path).as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        std::fs::remove_file(&path).ok();
    }
}
