//! Error taxonomy for the ingestion engine
//!
//! Cursor expiry and rate limiting never show up here: the fetch client
//! absorbs both internally. Everything below reaches the orchestrator and
//! triggers its drain sequence before being returned to the caller.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A raw record could not be projected into a canonical row
    #[error("Validation error: {0}")]
    Validation(String),

    /// The API key was rejected by the rate-limited endpoint
    #[error("Authentication rejected by source (HTTP {status}). Check EVLOAD_API_KEY.")]
    Auth { status: u16 },

    /// The time-limited export token lapsed; resume with a fresh token
    #[error("Export token rejected by source (HTTP {status}); resume with a new EVLOAD_EXPORT_TOKEN")]
    CredentialExpired { status: u16 },

    /// Network or server failure that survived every retry
    #[error("Transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    /// Destination transaction failed; the batch was rolled back
    #[error("Write failed, batch of {rows} rows rolled back: {source}")]
    Write {
        rows: usize,
        #[source]
        source: sqlx::Error,
    },

    /// Checkpoint could not be read or persisted
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[source] sqlx::Error),

    /// Anything the fetch policy does not know how to classify
    #[error("Unclassified source failure: {0}")]
    Unknown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Cancellation observed while waiting inside the fetch client
    #[error("Ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether restarting the process (without operator changes) can make progress
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            IngestError::Transient { .. }
                | IngestError::Write { .. }
                | IngestError::Checkpoint(_)
                | IngestError::Cancelled
        )
    }

    /// Short stable label used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation",
            IngestError::Auth { .. } => "auth",
            IngestError::CredentialExpired { .. } => "credential_expired",
            IngestError::Transient { .. } => "transient",
            IngestError::Write { .. } => "write",
            IngestError::Checkpoint(_) => "checkpoint",
            IngestError::Unknown(_) => "unknown",
            IngestError::Config(_) => "config",
            IngestError::Cancelled => "cancelled",
        }
    }
}

impl From<evload_common::CommonError> for IngestError {
    fn from(err: evload_common::CommonError) -> Self {
        IngestError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable_classification() {
        assert!(IngestError::Transient { attempts: 4, message: "503".into() }.is_resumable());
        assert!(IngestError::Cancelled.is_resumable());
        assert!(!IngestError::Auth { status: 401 }.is_resumable());
        assert!(!IngestError::CredentialExpired { status: 403 }.is_resumable());
        assert!(!IngestError::validation("missing id").is_resumable());
    }

    #[test]
    fn test_common_error_maps_to_config() {
        let err: IngestError = evload_common::CommonError::MissingEnv("DATABASE_URL".into()).into();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
