//! Ingestion orchestrator
//!
//! Drives one run: resume from the last checkpoint, pull pages until the source
//! is exhausted or the run is cancelled, then drain. The checkpoint only moves
//! once every row up to its position has been committed by the writer.
//!
//! ```text
//! Idle -> Resuming -> StandardPacing | Overlapped -> Draining -> Stopped
//! ```

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::fetch::PageSource;
use crate::normalize::Normalizer;
use crate::pacing::{select_pacing, PacingPolicy};
use crate::progress::{ProgressReporter, ProgressTracker, TracingReporter};
use crate::types::{CheckpointState, CursorToken, FetchPage};
use crate::writer::{BatchWriter, MergeTarget, WriterStats};

const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Resuming,
    StandardPacing,
    Overlapped,
    Draining,
    Stopped,
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Source reported no more pages
    Completed,
    Cancelled,
    /// The export token lapsed; everything fetched so far was drained, so a
    /// restart with a fresh token resumes where this run stopped
    CredentialExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Last persisted checkpoint
    pub checkpoint: CheckpointState,
    pub pages: u64,
    pub events: u64,
    pub checkpoint_saves: u64,
    pub stats: WriterStats,
}

/// Everything that happens to a page after it is fetched
///
/// Kept apart from the source so a fetch and a page write can be in flight
/// at the same time.
struct Pipeline<M, C> {
    writer: BatchWriter<M>,
    store: C,
    normalizer: Normalizer,
    /// Position after the last processed page
    pending: CheckpointState,
    /// Position whose rows are all committed
    committed: CheckpointState,
    /// Last state handed to the store
    saved: CheckpointState,
    checkpoint_every: u64,
    checkpoint_saves: u64,
    progress: ProgressTracker,
    reporter: Box<dyn ProgressReporter>,
}

impl<M: MergeTarget, C: CheckpointStore> Pipeline<M, C> {
    async fn resume(&mut self) -> Result<()> {
        let state = self.store.load().await?.unwrap_or_default();
        match &state.cursor_token {
            Some(cursor) => info!(
                cursor = %cursor,
                events_ingested = state.events_ingested,
                "Resuming from checkpoint"
            ),
            None => info!("No checkpoint found, starting from the head of the collection"),
        }
        self.pending = state.clone();
        self.committed = state.clone();
        self.saved = state;
        Ok(())
    }

    fn cursor(&self) -> Option<&CursorToken> {
        self.pending.cursor_token.as_ref()
    }

    async fn process_page(&mut self, page: FetchPage) -> Result<()> {
        // Fails before anything from this page is buffered
        let rows = self.normalizer.normalize_all(&page.records)?;
        let count = rows.len() as u64;

        let next_cursor = if page.cursor_is_meaningful() {
            page.next_cursor
        } else {
            None
        };
        self.pending = self.pending.advanced(next_cursor, count);

        if !rows.is_empty() {
            self.writer.add(rows).await?;
        }
        if self.writer.buffered() == 0 {
            self.committed = self.pending.clone();
            self.persist(false).await?;
        }

        self.progress.record_page(count, page.total);
        let snapshot = self
            .progress
            .snapshot(self.pending.events_ingested, self.writer.stats().rows_inserted);
        self.reporter.report(&snapshot);
        Ok(())
    }

    /// Save the committed state if it moved and the save threshold allows
    async fn persist(&mut self, force: bool) -> Result<()> {
        if self.committed == self.saved {
            return Ok(());
        }
        let since_save = self
            .committed
            .events_ingested
            .saturating_sub(self.saved.events_ingested);
        if !force && self.checkpoint_every > 0 && since_save < self.checkpoint_every {
            return Ok(());
        }

        self.store.save(&self.committed).await?;
        self.saved = self.committed.clone();
        self.checkpoint_saves += 1;
        debug!(
            events_ingested = self.saved.events_ingested,
            saves = self.checkpoint_saves,
            "Checkpoint advanced"
        );
        Ok(())
    }

    async fn drain(&mut self) -> Result<WriterStats> {
        self.writer.flush().await?;
        self.committed = self.pending.clone();
        self.persist(true).await?;
        self.writer.close().await
    }
}

/// Single-worker ingestion engine over a page source, merge target and
/// checkpoint store
pub struct IngestOrchestrator<S, M, C> {
    source: S,
    pipeline: Pipeline<M, C>,
    pacing: Box<dyn PacingPolicy>,
    page_size: u32,
    cancel: CancellationToken,
    state: EngineState,
}

impl<S, M, C> IngestOrchestrator<S, M, C>
where
    S: PageSource,
    M: MergeTarget,
    C: CheckpointStore,
{
    /// Defaults: pacing picked from the source's privilege, 1000-row pages,
    /// a checkpoint after every durable batch, progress logged via tracing
    pub fn new(source: S, writer: BatchWriter<M>, store: C, normalizer: Normalizer) -> Self {
        let pacing = select_pacing(source.is_privileged(), &Default::default());
        Self {
            source,
            pipeline: Pipeline {
                writer,
                store,
                normalizer,
                pending: CheckpointState::fresh(),
                committed: CheckpointState::fresh(),
                saved: CheckpointState::fresh(),
                checkpoint_every: 0,
                checkpoint_saves: 0,
                progress: ProgressTracker::new(None),
                reporter: Box::new(TracingReporter),
            },
            pacing,
            page_size: DEFAULT_PAGE_SIZE,
            cancel: CancellationToken::new(),
            state: EngineState::Idle,
        }
    }

    /// Wire up from configuration, with the writer's batch size and pacing
    /// taken from `config`
    pub fn from_config(source: S, target: M, store: C, config: &IngestConfig) -> Self {
        let pacing = select_pacing(source.is_privileged(), &config.pacing);
        Self::new(
            source,
            BatchWriter::new(target, config.writer.batch_size),
            store,
            Normalizer::new(config.fields.clone()),
        )
        .with_pacing(pacing)
        .with_page_size(config.source.page_size)
        .with_checkpoint_every(config.writer.checkpoint_every_events)
        .with_expected_total(config.pacing.expected_total)
    }

    pub fn with_pacing(mut self, pacing: Box<dyn PacingPolicy>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Minimum events between checkpoint saves; 0 saves after every durable batch
    pub fn with_checkpoint_every(mut self, events: u64) -> Self {
        self.pipeline.checkpoint_every = events;
        self
    }

    pub fn with_expected_total(mut self, total: Option<u64>) -> Self {
        self.pipeline.progress = ProgressTracker::new(total);
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.pipeline.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = ?self.state, to = ?next, "Engine state change");
        self.state = next;
    }

    /// Run to completion, cancellation, or credential expiry
    ///
    /// Every exit path drains the writer first. Errors other than credential
    /// expiry are returned after a best-effort drain.
    pub async fn run(&mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, pacing = self.pacing.name());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid) -> Result<RunReport> {
        info!(page_size = self.page_size, "Ingestion run starting");

        self.transition(EngineState::Resuming);
        if let Err(e) = self.pipeline.resume().await {
            self.transition(EngineState::Stopped);
            return Err(e);
        }

        let result = if self.pacing.max_read_ahead() > 0 {
            self.transition(EngineState::Overlapped);
            self.run_overlapped().await
        } else {
            self.transition(EngineState::StandardPacing);
            self.run_standard().await
        };

        self.transition(EngineState::Draining);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(IngestError::Cancelled) => RunOutcome::Cancelled,
            Err(IngestError::CredentialExpired { status }) => {
                warn!(status, "Export token expired, draining before stop");
                RunOutcome::CredentialExpired
            },
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Ingestion failed, draining buffered rows");
                if let Err(drain_err) = self.pipeline.drain().await {
                    error!(error = %drain_err, "Drain after failure did not complete");
                }
                self.transition(EngineState::Stopped);
                return Err(e);
            },
        };

        let drained = self.pipeline.drain().await;
        self.transition(EngineState::Stopped);
        let stats = drained?;

        let report = RunReport {
            run_id,
            outcome,
            checkpoint: self.pipeline.saved.clone(),
            pages: self.pipeline.progress.pages(),
            events: self.pipeline.progress.events_this_run(),
            checkpoint_saves: self.pipeline.checkpoint_saves,
            stats,
        };
        info!(
            outcome = ?report.outcome,
            pages = report.pages,
            events = report.events,
            rows_inserted = report.stats.rows_inserted,
            events_ingested = report.checkpoint.events_ingested,
            "Ingestion run finished"
        );
        Ok(report)
    }

    /// Fetch, process, then wait out the rest of the request interval
    async fn run_standard(&mut self) -> Result<RunOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let issued = Instant::now();
            let page = self
                .source
                .fetch_page(self.page_size, self.pipeline.cursor())
                .await?;
            check_continuation(&page)?;
            let has_more = page.has_more;
            self.pipeline.process_page(page).await?;

            if !has_more {
                return Ok(RunOutcome::Completed);
            }

            let wait = self.pacing.next_fetch_timing(issued.elapsed());
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {},
                    _ = self.cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                }
            }
        }
    }

    /// Fetch page N+1 while page N is normalized and written
    async fn run_overlapped(&mut self) -> Result<RunOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        let mut page = self
            .source
            .fetch_page(self.page_size, self.pipeline.cursor())
            .await?;

        loop {
            check_continuation(&page)?;

            if !page.has_more {
                self.pipeline.process_page(page).await?;
                return Ok(RunOutcome::Completed);
            }
            if self.cancel.is_cancelled() {
                self.pipeline.process_page(page).await?;
                return Ok(RunOutcome::Cancelled);
            }

            let next_cursor = page.next_cursor.clone();
            let (fetched, processed) = tokio::join!(
                self.source.fetch_page(self.page_size, next_cursor.as_ref()),
                self.pipeline.process_page(page),
            );
            processed?;
            page = fetched?;
        }
    }
}

/// A page promising more data must say where it continues
fn check_continuation(page: &FetchPage) -> Result<()> {
    if page.has_more && page.next_cursor.is_none() {
        return Err(IngestError::unknown(
            "source reported more pages but returned no next_cursor",
        ));
    }
    Ok(())
}
