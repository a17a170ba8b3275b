//! Test sessions for dynamically loaded native modules.
//!
//! This crate provides:
//! - Expectation sets: which entry points a fixture exports and how they behave
//! - Test sessions: load, resolve, invoke, unload, judge
//! - Verdicts: per-entry outcomes with named failure reasons
//! - Structured JSONL logging of session events
//! - Report generation: human-readable + machine-readable session reports
//!
//! All foreign-code handling lives in `modcheck-core`; this crate is safe Rust.

#![forbid(unsafe_code)]

pub mod diff;
pub mod expectation;
pub mod report;
pub mod session;
pub mod structured_log;
pub mod verdict;

pub use expectation::{Expectation, ExpectationFileError, ExpectationSet, Mismatch, Predicate};
pub use report::SessionReport;
pub use session::{TestSession, run_session};
pub use verdict::{EntryStatus, EntryVerdict, FailureReason, SessionState, Verdict};
