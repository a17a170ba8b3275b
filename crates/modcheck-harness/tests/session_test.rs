//! Integration test: full test sessions against the `mod_hello` fixture.
//!
//! Validates that:
//! 1. The canonical expectation set passes and walks every session state.
//! 2. A single wrong expectation fails exactly that entry.
//! 3. Load, resolve and signature failures carry distinct reasons.
//! 4. Failed sessions still unload the module.
//! 5. Session events are logged as schema-valid JSONL.
//!
//! Run: cargo test -p modcheck-harness --test session_test

use std::path::Path;

use modcheck_core::{InvocationSpec, ModuleLoader, Value, is_path_loaded};
use modcheck_harness::structured_log::{LogEmitter, validate_log_line};
use modcheck_harness::{
    EntryStatus, Expectation, ExpectationSet, FailureReason, Predicate, SessionState,
    TestSession, run_session,
};

const CANONICAL: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/expectations/hello.v1.json");

fn fixture() -> Option<&'static Path> {
    let module = modcheck_fixture::hello_module();
    if module.is_none() {
        eprintln!("Skipping: mod_hello fixture was not built (no C++ compiler)");
    }
    module
}

fn canonical() -> ExpectationSet {
    ExpectationSet::from_file(Path::new(CANONICAL)).expect("canonical set should parse")
}

fn hello(arg: i32, expect: Predicate) -> Expectation {
    Expectation::new(
        "hello",
        InvocationSpec::ints(1).unwrap(),
        vec![Value::I32(arg)],
        expect,
    )
}

#[test]
fn canonical_set_passes() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let verdict = run_session(path, canonical());
    assert!(verdict.passed(), "{verdict:#?}");
    assert_eq!(
        verdict.trail(),
        [
            SessionState::Idle,
            SessionState::Loaded,
            SessionState::Resolving,
            SessionState::Invoking,
            SessionState::Unloaded,
            SessionState::Verdicted,
        ]
    );
    assert_eq!(verdict.final_state(), SessionState::Verdicted);
    assert!(verdict.failure().is_none());
    assert_eq!(verdict.passed_count(), verdict.entries().len());
    assert!(verdict.init_output().contains("static_constructor"));
    assert!(verdict.finalizer_output().contains("static_destructor"));
    assert_eq!(verdict.module_sha256().map(str::len), Some(64));
    assert!(!is_path_loaded(path), "session must unload its module");

    let test2 = verdict
        .entries()
        .iter()
        .find(|e| e.symbol == "test2")
        .unwrap();
    assert_eq!(test2.returned, Some(1));
    assert!(test2.stdout.contains("test2 1 2 3"));
    assert!(test2.latency_ns.is_some());

    let touch = verdict
        .entries()
        .iter()
        .find(|e| e.symbol == "touch")
        .unwrap();
    assert_eq!(touch.returned, None);
    assert!(touch.passed());
}

#[test]
fn one_wrong_expectation_fails_one_entry() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let mut set = canonical();
    set.entries[0].expect = Predicate::Returns(5);
    let verdict = run_session(path, set);

    assert!(!verdict.passed());
    assert_eq!(verdict.final_state(), SessionState::Verdicted);
    assert!(verdict.failure().is_none());
    let failed: Vec<_> = verdict.failed_entries().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].symbol, "hello");
    assert_eq!(failed[0].returned, Some(0));
    assert_eq!(
        failed[0].status,
        EntryStatus::Failed {
            reason: FailureReason::ExpectationFailed {
                expected: "returns 5".to_string(),
                actual: "returned 0".to_string(),
            },
        }
    );
    assert_eq!(verdict.passed_count(), verdict.entries().len() - 1);
}

#[test]
fn missing_module_is_module_not_found() {
    let set = ExpectationSet::new("ghost", vec![hello(0, Predicate::Returns(0))]);
    let verdict = run_session("/nonexistent/modcheck/libmod_ghost.so", set);

    assert!(!verdict.passed());
    assert_eq!(verdict.trail(), [SessionState::Idle, SessionState::Failed]);
    assert!(matches!(
        verdict.failure(),
        Some(FailureReason::ModuleNotFound { .. })
    ));
    assert_eq!(verdict.entries()[0].status, EntryStatus::NotRun);
}

#[test]
fn missing_required_symbol_fails_before_any_call() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let set = ExpectationSet::new(
        "hello-typo",
        vec![
            hello(0, Predicate::Returns(0)),
            Expectation::new("hellp", InvocationSpec::nullary(), vec![], Predicate::Truthy),
            Expectation::new("test", InvocationSpec::nullary(), vec![], Predicate::Truthy),
        ],
    );
    let verdict = run_session(path, set);

    assert!(!verdict.passed());
    assert_eq!(
        verdict.trail(),
        [
            SessionState::Idle,
            SessionState::Loaded,
            SessionState::Resolving,
            SessionState::Failed,
        ]
    );
    let reason = FailureReason::SymbolNotFound {
        symbol: "hellp".to_string(),
    };
    assert_eq!(verdict.failure(), Some(&reason));
    let entries = verdict.entries();
    assert_eq!(entries[0].status, EntryStatus::NotRun);
    assert_eq!(entries[1].status, EntryStatus::Failed { reason });
    assert_eq!(entries[2].status, EntryStatus::NotRun);
    assert!(entries[0].stdout.is_empty(), "nothing may be called");

    assert!(verdict.finalizer_output().contains("static_destructor"));
    assert!(!is_path_loaded(path));
}

#[test]
fn missing_optional_symbol_is_skipped() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let set = ExpectationSet::new(
        "hello-optional",
        vec![
            hello(10, Predicate::Returns(-10)),
            Expectation::new("goodbye", InvocationSpec::nullary(), vec![], Predicate::Truthy)
                .optional(),
        ],
    );
    let verdict = run_session(path, set);

    assert!(verdict.passed(), "{verdict:#?}");
    assert_eq!(verdict.skipped_count(), 1);
    assert!(matches!(
        &verdict.entries()[1].status,
        EntryStatus::Skipped {
            reason: FailureReason::SymbolNotFound { symbol }
        } if symbol == "goodbye"
    ));
}

#[test]
fn signature_mismatch_fails_without_calling() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let set = ExpectationSet::new(
        "hello-mismatch",
        vec![
            hello(0, Predicate::Returns(0)),
            Expectation::new(
                "test2",
                InvocationSpec::ints(3).unwrap(),
                vec![Value::I32(1)],
                Predicate::Returns(1),
            ),
            Expectation::new("test", InvocationSpec::nullary(), vec![], Predicate::Truthy),
        ],
    );
    let verdict = run_session(path, set);

    assert!(!verdict.passed());
    assert_eq!(verdict.final_state(), SessionState::Failed);
    assert_eq!(
        &verdict.trail()[verdict.trail().len() - 2..],
        [SessionState::Invoking, SessionState::Failed]
    );
    assert!(matches!(
        verdict.failure(),
        Some(FailureReason::SignatureMismatch { symbol, .. }) if symbol == "test2"
    ));
    let entries = verdict.entries();
    assert!(entries[0].passed());
    assert!(entries[1].stdout.is_empty());
    assert_eq!(entries[1].returned, None);
    assert_eq!(entries[2].status, EntryStatus::NotRun);
    assert!(!is_path_loaded(path));
}

#[test]
fn module_held_elsewhere_is_already_loaded() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let mut outer = ModuleLoader::new();
    let handle = outer.load(path).expect("fixture should load");

    let verdict = run_session(path, canonical());
    assert!(!verdict.passed());
    assert!(matches!(
        verdict.failure(),
        Some(FailureReason::ModuleAlreadyLoaded { .. })
    ));
    assert_eq!(verdict.trail(), [SessionState::Idle, SessionState::Failed]);
    assert!(outer.is_loaded(handle), "a failed session must not touch other loaders");

    outer.unload(handle).unwrap();
}

#[test]
fn stdout_equals_mismatch_carries_diff() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let set = ExpectationSet::new(
        "hello-diff",
        vec![hello(
            1,
            Predicate::StdoutEquals("Hello World! arg=2\n".to_string()),
        )],
    );
    let verdict = run_session(path, set);

    assert!(!verdict.passed());
    let diff = verdict.entries()[0].diff.as_deref().expect("diff rendered");
    assert!(diff.contains("-Hello World! arg=2"), "{diff}");
}

#[test]
fn custom_predicates_run_in_process() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let set = ExpectationSet::new(
        "hello-custom",
        vec![hello(
            21,
            Predicate::custom("negates its argument", |r| r.returned == Some(-21)),
        )],
    );
    assert!(run_session(path, set).passed());
}

#[test]
fn session_events_are_valid_jsonl() {
    let Some(path) = fixture() else { return };
    let _serial = modcheck_fixture::exclusive();

    let mut log = LogEmitter::to_buffer("session-test");
    let verdict = TestSession::new(path, canonical()).with_log(&mut log).run();
    assert!(verdict.passed());

    let lines = log.buffered_lines();
    let entries: Vec<_> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| validate_log_line(line, i + 1).expect("log line should validate"))
        .collect();

    let events: Vec<&str> = entries.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(events.first(), Some(&"session_start"));
    assert_eq!(events.last(), Some(&"verdict"));
    for event in ["module_loaded", "symbol_resolved", "entry_result", "module_unloaded"] {
        assert!(events.contains(&event), "missing {event}: {events:?}");
    }
    assert_eq!(
        events.iter().filter(|e| **e == "entry_result").count(),
        verdict.entries().len()
    );
    assert!(
        entries
            .iter()
            .all(|e| e.trace_id.starts_with("session-test::hello::"))
    );
    assert!(entries.iter().all(|e| e.fixture.as_deref() == Some("hello")));
}
