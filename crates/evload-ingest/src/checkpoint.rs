//! Checkpoint store
//!
//! The checkpoint table is append-only: every save inserts a new row and
//! `load()` returns the one with the highest id for the stream, whatever its
//! `updated_at` says. Older rows double as an audit trail of how a run
//! progressed until `prune` trims them.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::types::{CheckpointState, CursorToken};

pub const CHECKPOINT_TABLE: &str = "ingest_checkpoints";

/// Durable home of the resume position
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Most recently saved state, or `None` on a fresh start
    async fn load(&self) -> Result<Option<CheckpointState>>;

    /// Persist `state`; an error means the checkpoint did not advance
    async fn save(&self, state: &CheckpointState) -> Result<()>;
}

/// PostgreSQL-backed store, one logical checkpoint per stream name
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
    stream: String,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Delete all but the newest `keep` rows for this stream
    pub async fn prune(&self, keep: i64) -> Result<u64> {
        let deleted = sqlx::query(&format!(
            r#"
            DELETE FROM {CHECKPOINT_TABLE}
            WHERE stream = $1
              AND id NOT IN (
                  SELECT id FROM {CHECKPOINT_TABLE}
                  WHERE stream = $1
                  ORDER BY id DESC
                  LIMIT $2
              )
            "#
        ))
        .bind(&self.stream)
        .bind(keep.max(1))
        .execute(&self.pool)
        .await
        .map_err(IngestError::Checkpoint)?
        .rows_affected();

        Ok(deleted)
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self) -> Result<Option<CheckpointState>> {
        let row: Option<(Option<String>, i64)> = sqlx::query_as(&format!(
            r#"
            SELECT cursor_token, events_ingested
            FROM {CHECKPOINT_TABLE}
            WHERE stream = $1
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(&self.stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(IngestError::Checkpoint)?;

        row.map(|(cursor_token, events_ingested)| {
            let events_ingested = u64::try_from(events_ingested).map_err(|_| {
                IngestError::unknown(format!(
                    "checkpoint for stream '{}' holds negative event count {events_ingested}",
                    self.stream
                ))
            })?;
            Ok(CheckpointState {
                cursor_token: cursor_token.map(CursorToken::new),
                events_ingested,
            })
        })
        .transpose()
    }

    async fn save(&self, state: &CheckpointState) -> Result<()> {
        let events_ingested = i64::try_from(state.events_ingested).map_err(|_| {
            IngestError::unknown(format!(
                "event count {} does not fit the checkpoint column",
                state.events_ingested
            ))
        })?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {CHECKPOINT_TABLE} (stream, cursor_token, events_ingested, updated_at)
            VALUES ($1, $2, $3, clock_timestamp())
            "#
        ))
        .bind(&self.stream)
        .bind(state.cursor_token.as_ref().map(CursorToken::as_str))
        .bind(events_ingested)
        .execute(&self.pool)
        .await
        .map_err(IngestError::Checkpoint)?;

        debug!(
            stream = %self.stream,
            events_ingested = state.events_ingested,
            "Checkpoint saved"
        );
        Ok(())
    }
}
