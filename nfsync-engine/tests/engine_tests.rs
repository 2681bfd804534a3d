//! Synchronization engine runs against in-memory providers and real
//! on-disk stores.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{doc, engine_in, fast_settings, init_logging, range, FakeSink, FakeSource};
use nfsync_core::{IdentifierRegistry, LedgerStore, RunStatusStore, TaxId};
use nfsync_engine::pipeline::build_engine_with;
use nfsync_engine::{RunOutcome, RunRequest};
use tempfile::TempDir;

const A: &str = "11111111111";
const B: &str = "22222222222222";
const C: &str = "33333333333";

fn registry(dir: &TempDir, ids: &[&str]) -> IdentifierRegistry {
    let registry = IdentifierRegistry::at(dir.path());
    for id in ids {
        registry.add(id).expect("add");
    }
    registry
}

fn request(ids: &[&str]) -> RunRequest {
    RunRequest::new(ids.iter().map(|s| s.to_string()).collect(), range())
}

fn tax(id: &str) -> TaxId {
    TaxId::parse(id).expect("tax id")
}

fn completed(outcome: RunOutcome) -> nfsync_engine::RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 1. Guards
// ---------------------------------------------------------------------------

#[test]
fn run_while_processing_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A]);
    let source = Arc::new(FakeSource::new().with(A, 1, vec![doc("k")]));
    let engine = engine_in(dir.path(), source.clone(), Arc::new(FakeSink::new()));
    let before = registry.list_all().expect("list");

    let _held = engine.try_begin().expect("permit");
    let outcome = engine.run(request(&[A])).expect("run");

    assert_eq!(outcome, RunOutcome::AlreadyRunning);
    assert!(source.counted().is_empty());
    assert!(!RunStatusStore::at(dir.path()).path().exists());
    assert_eq!(registry.list_all().expect("list"), before);
}

#[test]
fn missing_parameters_are_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let engine = engine_in(dir.path(), Arc::new(FakeSource::new()), Arc::new(FakeSink::new()));
    let outcome = engine
        .run(RunRequest {
            identifiers: Some(vec![A.to_string()]),
            range: None,
        })
        .expect("run");
    assert_eq!(outcome, RunOutcome::MissingParameters);
    assert!(!engine.processing_state().is_processing);
}

#[test]
fn unknown_identifiers_finish_idle() {
    let dir = TempDir::new().expect("tempdir");
    registry(&dir, &[A]);
    let engine = engine_in(dir.path(), Arc::new(FakeSource::new()), Arc::new(FakeSink::new()));

    let outcome = engine.run(request(&["99999999999"])).expect("run");

    assert_eq!(outcome, RunOutcome::NoValidIdentifiers);
    let state = engine.processing_state();
    assert!(!state.is_processing);
    assert!(state.status_message.contains("No valid identifiers"));
}

// ---------------------------------------------------------------------------
// 2. Per-identifier algorithm
// ---------------------------------------------------------------------------

#[test]
fn zero_count_records_success_without_fetch_or_dispatch() {
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A]);
    let source = Arc::new(FakeSource::new().with(A, 0, vec![]));
    let sink = Arc::new(FakeSink::new());
    let engine = engine_in(dir.path(), source.clone(), sink.clone());

    let report = completed(engine.run(request(&[A])).expect("run"));

    assert_eq!(report.summary.found, 0);
    assert_eq!(report.summary.processed_identifiers, 1);
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.credential_calls(), 0);
    assert!(!LedgerStore::at(dir.path()).path().exists());

    let record = registry.get(&tax(A)).expect("get").expect("record");
    assert_eq!(record.last_found(), 0);
    assert!(record.last_checked_at.is_some());
}

#[test]
fn partial_fetch_counts_missing_documents_as_skipped() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A]);
    let docs: Vec<_> = (0..10).map(|n| doc(&format!("a{n}"))).collect();
    let source = Arc::new(FakeSource::new().with(A, 15, docs));
    let engine = engine_in(dir.path(), source, Arc::new(FakeSink::new()));

    let report = completed(engine.run(request(&[A])).expect("run"));

    assert_eq!(report.summary.found, 15);
    assert_eq!(report.summary.sent, 10);
    assert_eq!(report.summary.skipped, 5);
    let record = registry.get(&tax(A)).expect("get").expect("record");
    assert_eq!(record.last_found(), 10, "found on the record is what was fetched");
}

#[test]
fn identifier_error_is_recorded_and_run_continues() {
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A, B]);
    let source = Arc::new(
        FakeSource::new()
            .failing(A, 503)
            .with(B, 2, vec![doc("b1"), doc("b2")]),
    );
    let engine = engine_in(dir.path(), source.clone(), Arc::new(FakeSink::new()));

    let report = completed(engine.run(request(&[A, B])).expect("run"));

    assert_eq!(report.identifiers_in_error, 1);
    assert_eq!(report.summary.sent, 2);
    assert_eq!(report.summary.processed_identifiers, 2);

    let failed = registry.get(&tax(A)).expect("get").expect("record");
    assert_eq!(failed.consecutive_failures, 1);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("503"));

    let state = engine.processing_state();
    assert!(!state.is_processing);
    assert_eq!(state.status_message, "Finished with 1 identifier(s) in error.");
}

#[test]
fn success_resets_failure_counter() {
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A]);
    registry.increment_failure_count(&tax(A)).expect("inc");
    registry.increment_failure_count(&tax(A)).expect("inc");
    registry.record_error(&tax(A), "timeout").expect("err");

    let source = Arc::new(FakeSource::new().with(A, 0, vec![]));
    let engine = engine_in(dir.path(), source, Arc::new(FakeSink::new()));
    completed(engine.run(request(&[A])).expect("run"));

    let record = registry.get(&tax(A)).expect("get").expect("record");
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.last_error.is_none());
}

#[test]
fn identifier_at_failure_threshold_is_not_contacted() {
    let dir = TempDir::new().expect("tempdir");
    let registry = registry(&dir, &[A, B]);
    for _ in 0..3 {
        registry.increment_failure_count(&tax(A)).expect("inc");
    }
    let source = Arc::new(FakeSource::new().with(A, 4, vec![]).with(B, 0, vec![]));
    let engine = engine_in(dir.path(), source.clone(), Arc::new(FakeSink::new()));

    let report = completed(engine.run(request(&[A, B])).expect("run"));

    assert_eq!(source.counted(), vec![B.to_string()]);
    assert_eq!(report.identifiers_in_error, 1);
    assert_eq!(report.summary.processed_identifiers, 1);
    assert_eq!(engine.processing_state().progress, 0, "idle after the run");

    let record = registry.get(&tax(A)).expect("get").expect("record");
    assert_eq!(record.consecutive_failures, 3, "skipping does not count as a failure");
}

#[test]
fn zero_failure_threshold_still_processes_healthy_identifiers() {
    let dir = TempDir::new().expect("tempdir");
    registry(&dir, &[A]);
    let mut settings = fast_settings();
    settings.engine.failure_threshold = 0;
    let source = Arc::new(FakeSource::new().with(A, 1, vec![doc("k0")]));
    let sink = Arc::new(FakeSink::new());
    let engine = build_engine_with(dir.path(), &settings, source.clone(), sink.clone());

    let report = completed(engine.run(request(&[A])).expect("run"));

    assert_eq!(source.counted(), vec![A.to_string()]);
    assert_eq!(report.identifiers_in_error, 0);
    assert_eq!(report.summary.sent, 1);
    assert_eq!(sink.writes_for("k0"), 1);
}

#[test]
fn identifiers_are_processed_in_input_order_once() {
    let dir = TempDir::new().expect("tempdir");
    registry(&dir, &[A, B, C]);
    let source = Arc::new(FakeSource::new());
    let engine = engine_in(dir.path(), source.clone(), Arc::new(FakeSink::new()));

    completed(
        engine
            .run(request(&[C, "111.111.111-11", B, A]))
            .expect("run"),
    );

    assert_eq!(
        source.counted(),
        vec![C.to_string(), A.to_string(), B.to_string()]
    );
}

// ---------------------------------------------------------------------------
// 3. Run status
// ---------------------------------------------------------------------------

#[test]
fn run_status_is_overwritten_with_the_latest_summary() {
    let dir = TempDir::new().expect("tempdir");
    registry(&dir, &[A]);
    let source = Arc::new(FakeSource::new().with(A, 3, vec![doc("x"), doc("y"), doc("z")]));
    let engine = engine_in(dir.path(), source, Arc::new(FakeSink::new()));
    let store = RunStatusStore::at(dir.path());

    completed(engine.run(request(&[A])).expect("first run"));
    let first = store.load().expect("load").summary.expect("summary");
    assert_eq!((first.found, first.sent, first.skipped), (3, 3, 0));

    completed(engine.run(request(&[A])).expect("second run"));
    let status = store.load().expect("load");
    let second = status.summary.expect("summary");
    assert_eq!((second.found, second.sent, second.skipped), (3, 0, 3));
    assert!(status.last_run_at.is_some());
    assert_eq!(
        engine.processing_state().status_message,
        "Finished successfully."
    );
}
