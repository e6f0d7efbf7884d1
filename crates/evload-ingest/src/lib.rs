//! evload Ingest Library
//!
//! Resumable bulk loader that pulls events from a cursor-paginated HTTP source
//! into PostgreSQL.
//!
//! # Components
//!
//! - **fetch**: page client with retry, rate-limit, and cursor-expiry handling
//! - **normalize**: raw JSON records to canonical rows
//! - **writer**: buffered, idempotent batch merge through a holding table
//! - **checkpoint**: append-only resume positions
//! - **orchestrator**: the run loop tying them together
//!
//! # Example
//!
//! ```no_run
//! use evload_ingest::{
//!     FetchClient, IngestConfig, IngestOrchestrator, PgCheckpointStore, PgMergeTarget, RetryPolicy,
//! };
//! use sqlx::postgres::PgPoolOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pool = PgPoolOptions::new().connect(&config.database.url).await?;
//!
//!     let source = FetchClient::new(&config.source, RetryPolicy::from(&config.retry))?;
//!     let mut orchestrator = IngestOrchestrator::from_config(
//!         source,
//!         PgMergeTarget::new(pool.clone()),
//!         PgCheckpointStore::new(pool, config.stream.clone()),
//!         &config,
//!     );
//!     let report = orchestrator.run().await?;
//!     println!("{:?}", report.outcome);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod pacing;
pub mod progress;
pub mod types;
pub mod writer;

pub use checkpoint::{CheckpointStore, PgCheckpointStore};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use fetch::{FetchClient, PageSource, RetryPolicy};
pub use normalize::{FieldMapping, Normalizer};
pub use orchestrator::{EngineState, IngestOrchestrator, RunOutcome, RunReport};
pub use pacing::{OverlappedPacing, PacingPolicy, StandardPacing};
pub use progress::{ProgressReporter, ProgressSnapshot, SilentReporter, TracingReporter};
pub use types::{CanonicalRow, CheckpointState, CursorToken, FetchPage, RawRecord};
pub use writer::{BatchWriter, MergeTarget, PgMergeTarget, WriterStats};
