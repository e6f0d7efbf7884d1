//! Response classification and retry decisions
//!
//! Two pure steps, kept apart from the HTTP client so the precedence rules can
//! be tested without a network:
//!
//! 1. [`classify`] maps a failed response onto a [`ResponseClass`]
//! 2. [`RetryPolicy::decide`] maps that class onto a [`RetryAction`]
//!
//! Precedence, highest first: auth / credential expiry, rejected cursor,
//! rate limit, transient, unknown.
//!
//! | Class          | Standard endpoint  | Privileged endpoint        |
//! |----------------|--------------------|----------------------------|
//! | Unauthorized   | fail `Auth`        | fail `CredentialExpired`   |
//! | CursorRejected | clear cursor once  | clear cursor once          |
//! | RateLimited    | wait hint + margin | wait hint + margin         |
//! | Transient      | backoff 1s/2s/4s   | backoff 1s/2s/4s           |
//! | Unknown        | fail `Unknown`     | fail `Unknown`             |

use std::time::Duration;

use reqwest::StatusCode;

use crate::config::RetryConfig;
use crate::error::IngestError;

/// Source error codes that mean "this cursor is no longer valid"
pub const CURSOR_REJECTED_CODES: [&str; 2] = ["invalid_cursor", "cursor_expired"];

/// Which source endpoint a request went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Rate-limited endpoint, API key only
    Standard,
    /// Throughput-unconstrained export endpoint, needs the time-limited token
    Privileged,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Standard => "v1/events",
            Endpoint::Privileged => "v1/events/export",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Standard => "standard",
            Endpoint::Privileged => "privileged",
        }
    }
}

/// Category of a failed fetch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    /// 401 or 403
    Unauthorized { status: u16 },
    /// Source refused the supplied cursor
    CursorRejected,
    /// 429, with the `Retry-After` hint when one was sent
    RateLimited { retry_after: Option<Duration> },
    /// Network failure, timeout, or 5xx
    Transient(String),
    Unknown(String),
}

/// What the fetch loop does next
#[derive(Debug)]
pub enum RetryAction {
    Fail(IngestError),
    /// Drop the cursor and retry from the head of the collection
    ClearCursor,
    /// Rate-limit pause; never counts towards the retry cap
    Wait(Duration),
    /// Transient-failure pause before retry number `retry`
    Backoff { retry: u32, delay: Duration },
}

/// Per-call failure bookkeeping; a new call starts from zero
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub transient_failures: u32,
    pub rate_limit_waits: u32,
    pub cursor_cleared: bool,
}

/// Classify a non-success HTTP response
///
/// `error_code` is the source's machine-readable code from the body, if any.
pub fn classify(
    status: StatusCode,
    error_code: Option<&str>,
    retry_after: Option<Duration>,
    detail: &str,
) -> ResponseClass {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ResponseClass::Unauthorized {
            status: status.as_u16(),
        };
    }

    let cursor_code = error_code.is_some_and(|code| CURSOR_REJECTED_CODES.contains(&code));
    if cursor_code && (status == StatusCode::BAD_REQUEST || status == StatusCode::GONE) {
        return ResponseClass::CursorRejected;
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ResponseClass::RateLimited { retry_after };
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ResponseClass::Transient(format!("HTTP {status}: {detail}"));
    }

    ResponseClass::Unknown(format!("HTTP {status}: {detail}"))
}

/// Classify a transport-level failure (no HTTP status available)
pub fn classify_transport(err: &reqwest::Error) -> ResponseClass {
    if err.is_builder() {
        ResponseClass::Unknown(format!("could not build request: {err}"))
    } else if err.is_timeout() {
        ResponseClass::Transient(format!("request timed out: {err}"))
    } else {
        ResponseClass::Transient(format!("transport error: {err}"))
    }
}

/// Parse a `Retry-After` header carrying integer seconds
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Retry and rate-limit timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry
    pub base_backoff: Duration,
    /// Added on top of every rate-limit hint
    pub rate_limit_margin: Duration,
    /// Used when a 429 carries no usable `Retry-After`
    pub default_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            rate_limit_margin: Duration::from_millis(250),
            default_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            rate_limit_margin: Duration::from_millis(config.rate_limit_margin_ms),
            default_rate_limit_wait: Duration::from_secs(config.default_rate_limit_wait_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn decide(
        &self,
        class: ResponseClass,
        endpoint: Endpoint,
        cursor_supplied: bool,
        state: &mut AttemptState,
    ) -> RetryAction {
        match class {
            ResponseClass::Unauthorized { status } => match endpoint {
                Endpoint::Standard => RetryAction::Fail(IngestError::Auth { status }),
                Endpoint::Privileged => {
                    RetryAction::Fail(IngestError::CredentialExpired { status })
                },
            },
            ResponseClass::CursorRejected => {
                if cursor_supplied && !state.cursor_cleared {
                    state.cursor_cleared = true;
                    RetryAction::ClearCursor
                } else {
                    RetryAction::Fail(IngestError::unknown(if cursor_supplied {
                        "source rejected the cursor twice in one call"
                    } else {
                        "source reported a cursor error but no cursor was sent"
                    }))
                }
            },
            ResponseClass::RateLimited { retry_after } => {
                state.rate_limit_waits += 1;
                let hint = retry_after.unwrap_or(self.default_rate_limit_wait);
                RetryAction::Wait(hint + self.rate_limit_margin)
            },
            ResponseClass::Transient(message) => {
                state.transient_failures += 1;
                if state.transient_failures > self.max_retries {
                    RetryAction::Fail(IngestError::Transient {
                        attempts: state.transient_failures,
                        message,
                    })
                } else {
                    RetryAction::Backoff {
                        retry: state.transient_failures,
                        delay: self.backoff_delay(state.transient_failures),
                    }
                }
            },
            ResponseClass::Unknown(message) => RetryAction::Fail(IngestError::Unknown(message)),
        }
    }
}
