//! Per-page progress reporting

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Snapshot emitted after every page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub pages: u64,
    pub events_this_run: u64,
    /// Including events ingested by previous runs
    pub events_total: u64,
    pub rows_inserted: u64,
    pub events_per_sec: f64,
    pub eta: Option<Duration>,
    pub total: Option<u64>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> Option<f64> {
        self.total
            .filter(|t| *t > 0)
            .map(|t| (self.events_total as f64 / t as f64 * 100.0).min(100.0))
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Logs each snapshot at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, s: &ProgressSnapshot) {
        info!(
            pages = s.pages,
            events_this_run = s.events_this_run,
            events_total = s.events_total,
            rows_inserted = s.rows_inserted,
            events_per_sec = (s.events_per_sec * 10.0).round() / 10.0,
            eta_secs = s.eta.map(|d| d.as_secs()),
            percent = s.percent().map(|p| (p * 10.0).round() / 10.0),
            "Ingestion progress"
        );
    }
}

/// Drops every snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn report(&self, _snapshot: &ProgressSnapshot) {}
}

/// Accumulates counters and derives throughput and ETA
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    pages: u64,
    events_this_run: u64,
    expected_total: Option<u64>,
    source_total: Option<u64>,
}

impl ProgressTracker {
    pub fn new(expected_total: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            pages: 0,
            events_this_run: 0,
            expected_total,
            source_total: None,
        }
    }

    /// Record one page; the source's reported total wins over the configured one
    pub fn record_page(&mut self, events: u64, source_total: Option<u64>) {
        self.pages += 1;
        self.events_this_run += events;
        if source_total.is_some() {
            self.source_total = source_total;
        }
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn events_this_run(&self) -> u64 {
        self.events_this_run
    }

    pub fn snapshot(&self, events_total: u64, rows_inserted: u64) -> ProgressSnapshot {
        self.snapshot_at(self.started.elapsed(), events_total, rows_inserted)
    }

    fn snapshot_at(&self, elapsed: Duration, events_total: u64, rows_inserted: u64) -> ProgressSnapshot {
        let secs = elapsed.as_secs_f64();
        let events_per_sec = if secs > 0.0 {
            self.events_this_run as f64 / secs
        } else {
            0.0
        };

        let total = self.source_total.or(self.expected_total);
        let eta = total.and_then(|total| {
            let remaining = total.saturating_sub(events_total);
            if remaining == 0 {
                Some(Duration::ZERO)
            } else if events_per_sec > 0.0 {
                // None once the estimate no longer fits in a Duration
                Duration::try_from_secs_f64(remaining as f64 / events_per_sec).ok()
            } else {
                None
            }
        });

        ProgressSnapshot {
            pages: self.pages,
            events_this_run: self.events_this_run,
            events_total,
            rows_inserted,
            events_per_sec,
            eta,
            total,
        }
    }
}
