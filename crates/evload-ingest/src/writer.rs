//! Durable batch writer
//!
//! [`BatchWriter`] owns the in-memory buffer; [`MergeTarget`] is the bulk
//! merge behind it. [`PgMergeTarget`] runs every flush as one transaction:
//!
//! 1. bulk-load the batch into the UNLOGGED holding table (no constraints)
//! 2. `INSERT .. SELECT .. ON CONFLICT (id) DO NOTHING` into the destination
//! 3. empty the holding table
//! 4. commit
//!
//! Any failure rolls the whole batch back and leaves the buffer untouched, so
//! calling `flush()` again retries exactly the same rows.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::types::CanonicalRow;

/// Durable destination table, unique on `id`
pub const DESTINATION_TABLE: &str = "events";
/// UNLOGGED holding table with the destination's columns and no constraints
pub const STAGING_TABLE: &str = "events_staging";

/// Rows per staging INSERT; 4 binds per row stays under Postgres' 65535 limit
const STAGING_CHUNK_ROWS: usize = 10_000;

/// Bulk, idempotent merge of canonical rows into durable storage
#[async_trait]
pub trait MergeTarget: Send + Sync {
    /// Merge all rows atomically; returns how many ids were new
    ///
    /// Re-merging an id that already exists is a no-op, never an error.
    async fn merge_batch(&self, rows: &[CanonicalRow]) -> Result<u64>;

    /// Release resources held by the target
    async fn close(&self) {}
}

/// Counters kept by the writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub rows_added: u64,
    pub rows_flushed: u64,
    /// Rows that were new at the destination
    pub rows_inserted: u64,
    pub flushes: u64,
}

/// Buffers rows and flushes them through a [`MergeTarget`]
pub struct BatchWriter<M> {
    target: M,
    buffer: Vec<CanonicalRow>,
    batch_size: usize,
    stats: WriterStats,
}

impl<M: MergeTarget> BatchWriter<M> {
    pub fn new(target: M, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            target,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            stats: WriterStats::default(),
        }
    }

    /// Append rows; flushes before returning once the batch threshold is hit
    ///
    /// Returns `true` when a flush ran. On flush failure the rows stay buffered.
    pub async fn add(&mut self, rows: Vec<CanonicalRow>) -> Result<bool> {
        self.stats.rows_added += rows.len() as u64;
        self.buffer.extend(rows);

        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Merge everything buffered; no-op when empty
    pub async fn flush(&mut self) -> Result<u64> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let rows = self.buffer.len();
        let inserted = self.target.merge_batch(&self.buffer).await?;

        // Only after commit
        self.buffer.clear();
        self.stats.rows_flushed += rows as u64;
        self.stats.rows_inserted += inserted;
        self.stats.flushes += 1;

        debug!(
            rows,
            inserted,
            duplicates = rows as u64 - inserted.min(rows as u64),
            "Batch flushed"
        );
        Ok(inserted)
    }

    /// Flush the remainder and release the target
    pub async fn close(&mut self) -> Result<WriterStats> {
        self.flush().await?;
        self.target.close().await;
        Ok(self.stats)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }
}

/// PostgreSQL merge through the holding table
#[derive(Clone)]
pub struct PgMergeTarget {
    pool: PgPool,
}

impl PgMergeTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MergeTarget for PgMergeTarget {
    async fn merge_batch(&self, rows: &[CanonicalRow]) -> Result<u64> {
        let write_err = |source: sqlx::Error| IngestError::Write {
            rows: rows.len(),
            source,
        };

        let mut tx = self.pool.begin().await.map_err(write_err)?;

        for chunk in rows.chunks(STAGING_CHUNK_ROWS) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {STAGING_TABLE} (id, category, occurred_at, payload) "
            ));
            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id())
                    .push_bind(row.category())
                    .push_bind(row.occurred_at())
                    .push_bind(Json(row.payload()));
            });
            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
        }

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {DESTINATION_TABLE} (id, category, occurred_at, payload)
            SELECT id, category, occurred_at, payload
            FROM {STAGING_TABLE}
            ON CONFLICT (id) DO NOTHING
            "#
        ))
        .execute(&mut *tx)
        .await
        .map_err(write_err)?
        .rows_affected();

        sqlx::query(&format!("DELETE FROM {STAGING_TABLE}"))
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

        tx.commit().await.map_err(write_err)?;

        info!(
            table = DESTINATION_TABLE,
            rows = rows.len(),
            inserted,
            "Merged batch"
        );
        Ok(inserted)
    }

    async fn close(&self) {
        debug!("Merge target released");
    }
}
