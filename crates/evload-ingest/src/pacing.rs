//! Request pacing
//!
//! Chosen once per run. The rate-limited endpoint gets a fixed inter-request
//! interval; the export endpoint runs fetch and processing concurrently.

use std::time::Duration;

use crate::config::PacingConfig;

/// Strategy deciding when the next fetch may be issued
pub trait PacingPolicy: Send + Sync {
    /// How long to wait before the next fetch, given time spent since the
    /// previous fetch was issued
    fn next_fetch_timing(&self, elapsed: Duration) -> Duration;

    /// Fetches allowed in flight while a page is being processed
    fn max_read_ahead(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Fixed spacing between request starts, one outstanding fetch
#[derive(Debug, Clone, Copy)]
pub struct StandardPacing {
    interval: Duration,
}

impl StandardPacing {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl PacingPolicy for StandardPacing {
    fn next_fetch_timing(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    fn max_read_ahead(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// No waiting; the next page is fetched while the current one is written
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlappedPacing;

impl PacingPolicy for OverlappedPacing {
    fn next_fetch_timing(&self, _elapsed: Duration) -> Duration {
        Duration::ZERO
    }

    fn max_read_ahead(&self) -> usize {
        1
    }

    fn name(&self) -> &'static str {
        "overlapped"
    }
}

pub fn select_pacing(privileged: bool, config: &PacingConfig) -> Box<dyn PacingPolicy> {
    if privileged {
        Box::new(OverlappedPacing)
    } else {
        Box::new(StandardPacing::new(config.request_interval()))
    }
}
