//! Core types shared by the fetch, write, and checkpoint stages

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw record as delivered by the source: an open-ended JSON object
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Opaque pagination token issued by the source
///
/// Stored and compared, never parsed or constructed from parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorToken(String);

impl CursorToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CursorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page returned by the source
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FetchPage {
    #[serde(rename = "data", default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub has_more: bool,
    /// Only meaningful when the page is non-empty or `has_more` is set
    #[serde(default)]
    pub next_cursor: Option<CursorToken>,
    /// Size of the whole collection, when the source reports it
    #[serde(default)]
    pub total: Option<u64>,
}

impl FetchPage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `next_cursor` may be trusted as a resume position
    pub fn cursor_is_meaningful(&self) -> bool {
        !self.records.is_empty() || self.has_more
    }
}

/// Canonical row written to the destination table
///
/// Built only by the normalizer; `id` is guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    id: String,
    category: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    payload: serde_json::Value,
}

impl CanonicalRow {
    pub(crate) fn new(
        id: String,
        category: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
        payload: serde_json::Value,
    ) -> Self {
        debug_assert!(!id.is_empty());
        Self {
            id,
            category,
            occurred_at,
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// Resume position plus progress counter
///
/// `cursor_token: None` means no page has been fetched yet, which is not the
/// same thing as an empty token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub cursor_token: Option<CursorToken>,
    pub events_ingested: u64,
}

impl CheckpointState {
    pub fn fresh() -> Self {
        Self::default()
    }

    /// State after a page of `rows` events ending at `next_cursor`
    ///
    /// A `None` cursor keeps the current position.
    pub fn advanced(&self, next_cursor: Option<CursorToken>, rows: u64) -> Self {
        Self {
            cursor_token: next_cursor.or_else(|| self.cursor_token.clone()),
            events_ingested: self.events_ingested.saturating_add(rows),
        }
    }
}
