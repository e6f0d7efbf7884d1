//! Paginated fetch client
//!
//! [`PageSource`] is the seam the orchestrator drives; [`FetchClient`] is the
//! HTTP implementation with the retry, rate-limit, and endpoint rules from
//! [`policy`].

pub mod client;
pub mod policy;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CursorToken, FetchPage};

pub use client::FetchClient;
pub use policy::{Endpoint, RetryPolicy};

/// Source of pages
///
/// One call yields one logical result: every internally recoverable condition
/// (rate limit, rejected cursor, retryable failure) is handled before returning.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page_size: u32, cursor: Option<&CursorToken>) -> Result<FetchPage>;

    /// Whether this source talks to the unconstrained export endpoint
    fn is_privileged(&self) -> bool;
}
