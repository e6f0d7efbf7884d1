//! Orchestrator tests with in-memory source, target and checkpoint store
//!
//! Verifies:
//! 1. The single-page scenario (one fetch, one write, one checkpoint)
//! 2. Resume from a stored checkpoint
//! 3. Checkpoints never run ahead of committed rows and only move forward
//! 4. Pacing (standard interval, overlapped read-ahead)
//! 5. Cancellation, credential expiry and fatal errors all drain first

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use evload_ingest::{
    BatchWriter, CheckpointState, CheckpointStore, CursorToken, EngineState, FetchPage,
    IngestError, IngestOrchestrator, MergeTarget, Normalizer, OverlappedPacing, PageSource,
    ProgressReporter, ProgressSnapshot, Result, RunOutcome, SilentReporter, StandardPacing,
    CanonicalRow,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fakes
// ============================================================================

/// Shared record of merges and saves, in the order they happened
type Journal = Arc<Mutex<Vec<String>>>;

struct ScriptedSource {
    script: Mutex<VecDeque<Result<FetchPage>>>,
    requested: Arc<Mutex<Vec<Option<String>>>>,
    privileged: bool,
    delay: Option<Duration>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<FetchPage>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requested: Arc::default(),
            privileged: false,
            delay: None,
        }
    }

    fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, _page_size: u32, cursor: Option<&CursorToken>) -> Result<FetchPage> {
        self.requested
            .lock()
            .unwrap()
            .push(cursor.map(|c| c.as_str().to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(IngestError::unknown("script exhausted")))
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}

#[derive(Clone, Default)]
struct MemoryTarget {
    ids: Arc<Mutex<BTreeSet<String>>>,
    journal: Journal,
    fail: bool,
    delay: Option<Duration>,
}

#[async_trait]
impl MergeTarget for MemoryTarget {
    async fn merge_batch(&self, rows: &[CanonicalRow]) -> Result<u64> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(IngestError::Write {
                rows: rows.len(),
                source: sqlx::Error::PoolTimedOut,
            });
        }
        let mut ids = self.ids.lock().unwrap();
        let inserted = rows.iter().filter(|r| ids.insert(r.id().to_string())).count();
        self.journal
            .lock()
            .unwrap()
            .push(format!("merge:{}", rows.len()));
        Ok(inserted as u64)
    }
}

#[derive(Clone, Default)]
struct MemoryStore {
    initial: Option<CheckpointState>,
    saves: Arc<Mutex<Vec<CheckpointState>>>,
    journal: Journal,
}

impl MemoryStore {
    fn saves(&self) -> Vec<CheckpointState> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self) -> Result<Option<CheckpointState>> {
        Ok(self
            .saves
            .lock()
            .unwrap()
            .last()
            .cloned()
            .or_else(|| self.initial.clone()))
    }

    async fn save(&self, state: &CheckpointState) -> Result<()> {
        self.saves.lock().unwrap().push(state.clone());
        self.journal
            .lock()
            .unwrap()
            .push(format!("save:{}", state.events_ingested));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CapturingReporter {
    snapshots: Arc<Mutex<Vec<ProgressSnapshot>>>,
}

impl ProgressReporter for CapturingReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn page(ids: &[&str], has_more: bool, next_cursor: Option<&str>) -> Result<FetchPage> {
    Ok(FetchPage {
        records: ids
            .iter()
            .map(|id| {
                json!({"id": id, "type": "view", "timestamp": 1769541612})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect(),
        has_more,
        next_cursor: next_cursor.map(CursorToken::new),
        total: None,
    })
}

fn checkpoint(cursor: &str, events: u64) -> CheckpointState {
    CheckpointState {
        cursor_token: Some(CursorToken::new(cursor)),
        events_ingested: events,
    }
}

fn orchestrator(
    source: ScriptedSource,
    target: MemoryTarget,
    store: MemoryStore,
    batch_size: usize,
) -> IngestOrchestrator<ScriptedSource, MemoryTarget, MemoryStore> {
    IngestOrchestrator::new(
        source,
        BatchWriter::new(target, batch_size),
        store,
        Normalizer::default(),
    )
    .with_pacing(Box::new(StandardPacing::new(Duration::ZERO)))
    .with_reporter(Box::new(SilentReporter))
}

fn stored_ids(target: &MemoryTarget) -> Vec<String> {
    target.ids.lock().unwrap().iter().cloned().collect()
}

// ============================================================================
// Scenario and resume
// ============================================================================

#[tokio::test]
async fn test_single_page_run_writes_and_checkpoints_once() {
    let source = ScriptedSource::new(vec![page(&["e1", "e2", "e3"], false, Some("c1"))]);
    let requested = source.requested.clone();
    let target = MemoryTarget::default();
    let store = MemoryStore::default();

    let mut engine = orchestrator(source, target.clone(), store.clone(), 5000);
    let report = engine.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(*requested.lock().unwrap(), vec![None]);
    assert_eq!(stored_ids(&target), vec!["e1", "e2", "e3"]);
    assert_eq!(store.saves(), vec![checkpoint("c1", 3)]);
    assert_eq!(report.checkpoint, checkpoint("c1", 3));
    assert_eq!(report.events, 3);
    assert_eq!(report.stats.rows_inserted, 3);
}

#[tokio::test]
async fn test_resume_requests_stored_cursor_and_adds_to_count() {
    let source = ScriptedSource::new(vec![page(&["e101", "e102"], false, Some("t6"))]);
    let requested = source.requested.clone();
    let store = MemoryStore {
        initial: Some(checkpoint("t5", 100)),
        ..Default::default()
    };

    let mut engine = orchestrator(source, MemoryTarget::default(), store.clone(), 10);
    engine.run().await.unwrap();

    assert_eq!(*requested.lock().unwrap(), vec![Some("t5".to_string())]);
    assert_eq!(store.saves(), vec![checkpoint("t6", 102)]);
}

#[tokio::test]
async fn test_rerun_after_completion_is_idempotent() {
    let target = MemoryTarget::default();
    let store = MemoryStore::default();

    let first = ScriptedSource::new(vec![page(&["a", "b"], false, Some("c1"))]);
    orchestrator(first, target.clone(), store.clone(), 10)
        .run()
        .await
        .unwrap();

    // Source replays the same tail page from the stored cursor
    let second = ScriptedSource::new(vec![page(&["a", "b"], false, Some("c1"))]);
    let report = orchestrator(second, target.clone(), store.clone(), 10)
        .run()
        .await
        .unwrap();

    assert_eq!(stored_ids(&target), vec!["a", "b"]);
    assert_eq!(report.stats.rows_inserted, 0);
}

// ============================================================================
// Checkpoint ordering
// ============================================================================

#[tokio::test]
async fn test_checkpoints_follow_commits_and_only_move_forward() {
    let journal = Journal::default();
    let source = ScriptedSource::new(vec![
        page(&["a", "b"], true, Some("c1")),
        page(&["c", "d"], true, Some("c2")),
        page(&["e", "f"], false, Some("c3")),
    ]);
    let target = MemoryTarget {
        journal: journal.clone(),
        ..Default::default()
    };
    let store = MemoryStore {
        journal: journal.clone(),
        ..Default::default()
    };

    orchestrator(source, target, store.clone(), 2)
        .run()
        .await
        .unwrap();

    let saves = store.saves();
    assert_eq!(
        saves,
        vec![checkpoint("c1", 2), checkpoint("c2", 4), checkpoint("c3", 6)]
    );
    assert!(saves
        .windows(2)
        .all(|w| w[0].events_ingested < w[1].events_ingested));
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["merge:2", "save:2", "merge:2", "save:4", "merge:2", "save:6"]
    );
}

#[tokio::test]
async fn test_checkpoint_waits_for_buffered_rows() {
    let source = ScriptedSource::new(vec![
        page(&["a", "b"], true, Some("c1")),
        page(&["c", "d"], true, Some("c2")),
        page(&["e", "f"], false, Some("c3")),
    ]);
    let store = MemoryStore::default();

    orchestrator(source, MemoryTarget::default(), store.clone(), 5)
        .run()
        .await
        .unwrap();

    // Nothing durable until the third page pushes the buffer past 5 rows
    assert_eq!(store.saves(), vec![checkpoint("c3", 6)]);
}

#[tokio::test]
async fn test_checkpoint_every_limits_saves() {
    let source = ScriptedSource::new(vec![
        page(&["a"], true, Some("c1")),
        page(&["b"], true, Some("c2")),
        page(&["c"], true, Some("c3")),
        page(&["d"], true, Some("c4")),
        page(&["e"], false, Some("c5")),
    ]);
    let store = MemoryStore::default();

    orchestrator(source, MemoryTarget::default(), store.clone(), 1)
        .with_checkpoint_every(2)
        .run()
        .await
        .unwrap();

    assert_eq!(
        store.saves(),
        vec![checkpoint("c2", 2), checkpoint("c4", 4), checkpoint("c5", 5)]
    );
}

#[tokio::test]
async fn test_empty_page_with_more_advances_cursor_only() {
    let source = ScriptedSource::new(vec![
        page(&[], true, Some("c1")),
        page(&["a"], false, Some("c2")),
    ]);
    let requested = source.requested.clone();
    let store = MemoryStore::default();

    orchestrator(source, MemoryTarget::default(), store.clone(), 10)
        .run()
        .await
        .unwrap();

    assert_eq!(
        *requested.lock().unwrap(),
        vec![None, Some("c1".to_string())]
    );
    assert_eq!(store.saves().first(), Some(&checkpoint("c1", 0)));
    assert_eq!(store.saves().last(), Some(&checkpoint("c2", 1)));
}

#[tokio::test]
async fn test_empty_final_page_leaves_checkpoint_untouched() {
    let source = ScriptedSource::new(vec![page(&[], false, Some("ignored"))]);
    let store = MemoryStore {
        initial: Some(checkpoint("t5", 5)),
        ..Default::default()
    };

    let report = orchestrator(source, MemoryTarget::default(), store.clone(), 10)
        .run()
        .await
        .unwrap();

    assert!(store.saves().is_empty());
    assert_eq!(report.checkpoint, checkpoint("t5", 5));
}

// ============================================================================
// Pacing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_standard_pacing_spaces_requests() {
    let source = ScriptedSource::new(vec![
        page(&["a"], true, Some("c1")),
        page(&["b"], true, Some("c2")),
        page(&["c"], false, Some("c3")),
    ]);

    let started = tokio::time::Instant::now();
    orchestrator(source, MemoryTarget::default(), MemoryStore::default(), 10)
        .with_pacing(Box::new(StandardPacing::new(Duration::from_millis(1000))))
        .run()
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn test_overlapped_fetches_while_writing() {
    let source = ScriptedSource::new(vec![
        page(&["a"], true, Some("c1")),
        page(&["b"], true, Some("c2")),
        page(&["c"], false, Some("c3")),
    ])
    .privileged()
    .with_delay(Duration::from_millis(100));
    let requested = source.requested.clone();
    let target = MemoryTarget {
        delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let store = MemoryStore::default();

    let started = tokio::time::Instant::now();
    let report = IngestOrchestrator::new(
        source,
        BatchWriter::new(target.clone(), 1),
        store.clone(),
        Normalizer::default(),
    )
    .with_pacing(Box::new(OverlappedPacing))
    .with_reporter(Box::new(SilentReporter))
    .run()
    .await
    .unwrap();

    // 3 fetches + 3 writes back to back would take 600ms
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        *requested.lock().unwrap(),
        vec![None, Some("c1".to_string()), Some("c2".to_string())]
    );
    assert_eq!(stored_ids(&target), vec!["a", "b", "c"]);
    assert_eq!(store.saves().last(), Some(&checkpoint("c3", 3)));
}

// ============================================================================
// Stop conditions
// ============================================================================

#[tokio::test]
async fn test_cancel_before_start_fetches_nothing() {
    let source = ScriptedSource::new(vec![page(&["a"], false, Some("c1"))]);
    let requested = source.requested.clone();
    let store = MemoryStore::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator(source, MemoryTarget::default(), store.clone(), 10)
        .with_cancellation(cancel)
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(requested.lock().unwrap().is_empty());
    assert!(store.saves().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_pacing_drains_buffer() {
    let source = ScriptedSource::new(vec![
        page(&["a", "b"], true, Some("c1")),
        page(&["c"], false, Some("c2")),
    ]);
    let requested = source.requested.clone();
    let target = MemoryTarget::default();
    let store = MemoryStore::default();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let report = orchestrator(source, target.clone(), store.clone(), 100)
        .with_pacing(Box::new(StandardPacing::new(Duration::from_millis(1000))))
        .with_cancellation(cancel)
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(requested.lock().unwrap().len(), 1);
    assert_eq!(stored_ids(&target), vec!["a", "b"]);
    assert_eq!(store.saves(), vec![checkpoint("c1", 2)]);
}

#[tokio::test]
async fn test_cancelled_error_from_source_is_clean_stop() {
    let source = ScriptedSource::new(vec![
        page(&["a"], true, Some("c1")),
        Err(IngestError::Cancelled),
    ]);
    let store = MemoryStore::default();

    let report = orchestrator(source, MemoryTarget::default(), store.clone(), 10)
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(store.saves(), vec![checkpoint("c1", 1)]);
}

#[tokio::test]
async fn test_credential_expiry_drains_and_reports() {
    let source = ScriptedSource::new(vec![
        page(&["a", "b"], true, Some("c1")),
        Err(IngestError::CredentialExpired { status: 403 }),
    ])
    .privileged();
    let target = MemoryTarget::default();
    let store = MemoryStore::default();

    let mut engine = IngestOrchestrator::new(
        source,
        BatchWriter::new(target.clone(), 100),
        store.clone(),
        Normalizer::default(),
    )
    .with_reporter(Box::new(SilentReporter));
    let report = engine.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::CredentialExpired);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(stored_ids(&target), vec!["a", "b"]);
    assert_eq!(store.saves(), vec![checkpoint("c1", 2)]);
}

#[tokio::test]
async fn test_fatal_fetch_error_drains_then_propagates() {
    let source = ScriptedSource::new(vec![
        page(&["a"], true, Some("c1")),
        Err(IngestError::Transient {
            attempts: 4,
            message: "HTTP 503".into(),
        }),
    ]);
    let target = MemoryTarget::default();
    let store = MemoryStore::default();

    let err = orchestrator(source, target.clone(), store.clone(), 100)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Transient { attempts: 4, .. }));
    assert_eq!(stored_ids(&target), vec!["a"]);
    assert_eq!(store.saves(), vec![checkpoint("c1", 1)]);
}

#[tokio::test]
async fn test_validation_error_buffers_nothing_from_bad_page() {
    let bad = FetchPage {
        records: vec![
            json!({"id": "ok"}).as_object().cloned().unwrap(),
            json!({"type": "no-id"}).as_object().cloned().unwrap(),
        ],
        has_more: false,
        next_cursor: Some(CursorToken::new("c2")),
        total: None,
    };
    let source = ScriptedSource::new(vec![page(&["a"], true, Some("c1")), Ok(bad)]);
    let target = MemoryTarget::default();
    let store = MemoryStore::default();

    let err = orchestrator(source, target.clone(), store.clone(), 100)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Validation(_)));
    assert_eq!(stored_ids(&target), vec!["a"]);
    assert_eq!(store.saves(), vec![checkpoint("c1", 1)]);
}

#[tokio::test]
async fn test_write_failure_never_advances_checkpoint() {
    let source = ScriptedSource::new(vec![page(&["a", "b"], false, Some("c1"))]);
    let target = MemoryTarget {
        fail: true,
        ..Default::default()
    };
    let store = MemoryStore::default();

    let err = orchestrator(source, target, store.clone(), 1)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Write { .. }));
    assert!(err.is_resumable());
    assert!(store.saves().is_empty());
}

#[tokio::test]
async fn test_more_pages_without_cursor_is_rejected() {
    let source = ScriptedSource::new(vec![page(&["a"], true, None)]);

    let err = orchestrator(source, MemoryTarget::default(), MemoryStore::default(), 10)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Unknown(_)));
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn test_progress_reported_per_page() {
    let mut second = page(&["c"], false, Some("c2")).unwrap();
    second.total = Some(10);
    let source = ScriptedSource::new(vec![page(&["a", "b"], true, Some("c1")), Ok(second)]);
    let reporter = CapturingReporter::default();
    let store = MemoryStore {
        initial: Some(checkpoint("c0", 4)),
        ..Default::default()
    };

    orchestrator(source, MemoryTarget::default(), store, 10)
        .with_reporter(Box::new(reporter.clone()))
        .run()
        .await
        .unwrap();

    let snapshots = reporter.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].events_this_run, 2);
    assert_eq!(snapshots[0].events_total, 6);
    assert_eq!(snapshots[0].total, None);
    assert_eq!(snapshots[1].pages, 2);
    assert_eq!(snapshots[1].events_total, 7);
    assert_eq!(snapshots[1].total, Some(10));
}
