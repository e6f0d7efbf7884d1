//! Ingestion configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary first) and validated once at startup. Required:
//! `EVLOAD_SOURCE_URL`, `EVLOAD_API_KEY`, `DATABASE_URL`.

use std::time::Duration;

use evload_common::env;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{IngestError, Result};
use crate::normalize::FieldMapping;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    pub source: SourceConfig,
    pub database: DatabaseConfig,
    pub writer: WriterConfig,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub fields: FieldMapping,
    /// Checkpoint key; lets several collections share one checkpoint table
    pub stream: String,
}

/// Remote source connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: String,
    /// Time-limited token for the export endpoint; selects overlapped pacing
    pub export_token: Option<String>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

/// Destination database settings
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Batch writer and checkpoint cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Rows buffered before a synchronous flush
    pub batch_size: usize,
    /// Persist the checkpoint once this many events accumulated since the
    /// last save; 0 persists after every durable batch
    pub checkpoint_every_events: u64,
}

/// Fetch pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Minimum spacing between requests on the rate-limited endpoint
    pub request_interval_ms: u64,
    /// Known collection size for ETA when the source does not report one
    pub expected_total: Option<u64>,
}

/// Retry and rate-limit timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub rate_limit_margin_ms: u64,
    pub default_rate_limit_wait_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            export_token: None,
            page_size: 1000,
            request_timeout_secs: 10,
            user_agent: concat!("evload-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            checkpoint_every_events: 0,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: 1000,
            expected_total: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1000,
            rate_limit_margin_ms: 250,
            default_rate_limit_wait_secs: 60,
        }
    }
}

// Secrets stay out of Debug output, which ends up in logs.
impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("export_token", &self.export_token.as_ref().map(|_| "<redacted>"))
            .field("page_size", &self.page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            source: SourceConfig::from_env()?,
            database: DatabaseConfig {
                url: env::require("DATABASE_URL")?,
                max_connections: env::var_or(
                    "EVLOAD_DB_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            writer: WriterConfig {
                batch_size: env::var_or("EVLOAD_BATCH_SIZE", defaults.writer.batch_size)?,
                checkpoint_every_events: env::var_or(
                    "EVLOAD_CHECKPOINT_EVERY",
                    defaults.writer.checkpoint_every_events,
                )?,
            },
            pacing: PacingConfig {
                request_interval_ms: env::var_or(
                    "EVLOAD_REQUEST_INTERVAL_MS",
                    defaults.pacing.request_interval_ms,
                )?,
                expected_total: env::parse_opt("EVLOAD_EXPECTED_TOTAL")?,
            },
            retry: RetryConfig {
                max_retries: env::var_or("EVLOAD_MAX_RETRIES", defaults.retry.max_retries)?,
                base_backoff_ms: env::var_or(
                    "EVLOAD_BACKOFF_BASE_MS",
                    defaults.retry.base_backoff_ms,
                )?,
                rate_limit_margin_ms: env::var_or(
                    "EVLOAD_RATE_LIMIT_MARGIN_MS",
                    defaults.retry.rate_limit_margin_ms,
                )?,
                default_rate_limit_wait_secs: env::var_or(
                    "EVLOAD_RATE_LIMIT_DEFAULT_WAIT_SECS",
                    defaults.retry.default_rate_limit_wait_secs,
                )?,
            },
            fields: FieldMapping {
                id_field: env::var_or("EVLOAD_ID_FIELD", defaults.fields.id_field)?,
                category_field: env::var_or(
                    "EVLOAD_CATEGORY_FIELD",
                    defaults.fields.category_field,
                )?,
                timestamp_field: env::var_or(
                    "EVLOAD_TIMESTAMP_FIELD",
                    defaults.fields.timestamp_field,
                )?,
            },
            stream: env::var_or("EVLOAD_STREAM", "events".to_string())?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;

        if self.database.url.is_empty() {
            return Err(IngestError::config("DATABASE_URL cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::config("EVLOAD_DB_MAX_CONNECTIONS must be greater than 0"));
        }
        if self.writer.batch_size == 0 {
            return Err(IngestError::config("EVLOAD_BATCH_SIZE must be greater than 0"));
        }
        if self.stream.trim().is_empty() {
            return Err(IngestError::config("EVLOAD_STREAM cannot be empty"));
        }
        for (name, value) in [
            ("EVLOAD_ID_FIELD", &self.fields.id_field),
            ("EVLOAD_CATEGORY_FIELD", &self.fields.category_field),
            ("EVLOAD_TIMESTAMP_FIELD", &self.fields.timestamp_field),
        ] {
            if value.is_empty() {
                return Err(IngestError::config(format!("{name} cannot be empty")));
            }
        }
        Ok(())
    }

    /// Whether the privileged export path is configured
    pub fn privileged(&self) -> bool {
        self.source.export_token.is_some()
    }
}

impl SourceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            base_url: env::require("EVLOAD_SOURCE_URL")?,
            api_key: env::require("EVLOAD_API_KEY")?,
            export_token: env::var_opt("EVLOAD_EXPORT_TOKEN"),
            page_size: env::var_or("EVLOAD_PAGE_SIZE", defaults.page_size)?,
            request_timeout_secs: env::var_or(
                "EVLOAD_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            user_agent: env::var_or("EVLOAD_USER_AGENT", defaults.user_agent)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            IngestError::config(format!("EVLOAD_SOURCE_URL '{}' is not a valid URL: {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(IngestError::config(format!(
                "EVLOAD_SOURCE_URL must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.api_key.is_empty() {
            return Err(IngestError::config("EVLOAD_API_KEY cannot be empty"));
        }
        if self.page_size == 0 {
            return Err(IngestError::config("EVLOAD_PAGE_SIZE must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestError::config("EVLOAD_REQUEST_TIMEOUT_SECS must be greater than 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PacingConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}
