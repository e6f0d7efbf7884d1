//! HTTP client for the paginated event source
//!
//! Wire contract:
//!
//! - `GET {base}/v1/events?limit=N[&cursor=T]` (rate-limited)
//! - `GET {base}/v1/events/export?limit=N[&cursor=T]` with `X-Export-Token`
//!   (unconstrained, used whenever an export token is configured)
//! - `Authorization: Bearer {api_key}` on both
//! - success body `{"data": [..], "has_more": bool, "next_cursor": str|null}`
//! - error body `{"error": {"code": str, "message": str}}`
//! - 429 carries `Retry-After` in integer seconds

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::policy::{self, AttemptState, Endpoint, ResponseClass, RetryAction, RetryPolicy};
use super::PageSource;
use crate::config::SourceConfig;
use crate::error::{IngestError, Result};
use crate::types::{CursorToken, FetchPage};

/// Header carrying the time-limited export token
pub const EXPORT_TOKEN_HEADER: &str = "X-Export-Token";

/// Longest error body excerpt kept in error messages
const MAX_DETAIL_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Paginated source client; cheap to share, reuses pooled connections
pub struct FetchClient {
    http: Client,
    base_url: Url,
    api_key: String,
    export_token: Option<String>,
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl FetchClient {
    pub fn new(config: &SourceConfig, policy: RetryPolicy) -> Result<Self> {
        config.validate()?;

        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| IngestError::config(format!("invalid source URL: {e}")))?;
        // Url::join replaces the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| IngestError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            export_token: config.export_token.clone(),
            policy,
            cancel: None,
        })
    }

    /// Interrupt rate-limit and backoff waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        if self.export_token.is_some() {
            Endpoint::Privileged
        } else {
            Endpoint::Standard
        }
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url> {
        self.base_url
            .join(endpoint.path())
            .map_err(|e| IngestError::config(format!("invalid endpoint URL: {e}")))
    }

    /// One HTTP round trip, classified
    async fn attempt(
        &self,
        url: &Url,
        endpoint: Endpoint,
        page_size: u32,
        cursor: Option<&CursorToken>,
    ) -> std::result::Result<FetchPage, ResponseClass> {
        let mut request = self
            .http
            .get(url.clone())
            .bearer_auth(&self.api_key)
            .query(&[("limit", page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }
        if let (Endpoint::Privileged, Some(token)) = (endpoint, &self.export_token) {
            request = request.header(EXPORT_TOKEN_HEADER, token);
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| policy::classify_transport(&e))?;

        debug!(
            endpoint = endpoint.as_str(),
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Source responded"
        );

        if response.status().is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| ResponseClass::Transient(format!("failed reading page body: {e}")))?;
            return serde_json::from_slice::<FetchPage>(&body)
                .map_err(|e| ResponseClass::Unknown(format!("undecodable page body: {e}")));
        }

        Err(classify_response(response).await)
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = token.cancelled() => Err(IngestError::Cancelled),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            },
        }
    }
}

async fn classify_response(response: Response) -> ResponseClass {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(policy::parse_retry_after);

    let body = response.text().await.unwrap_or_default();
    let envelope = serde_json::from_str::<ErrorEnvelope>(&body).ok();
    let code = envelope.as_ref().and_then(|env| {
        env.error
            .as_ref()
            .and_then(|e| e.code.clone())
            .or_else(|| env.code.clone())
    });
    let detail = envelope
        .as_ref()
        .and_then(|env| env.error.as_ref())
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.chars().take(MAX_DETAIL_CHARS).collect());

    policy::classify(status, code.as_deref(), retry_after, &detail)
}

#[async_trait]
impl PageSource for FetchClient {
    async fn fetch_page(&self, page_size: u32, cursor: Option<&CursorToken>) -> Result<FetchPage> {
        let endpoint = self.endpoint();
        let url = self.url(endpoint)?;
        let mut cursor = cursor.cloned();
        let mut state = AttemptState::default();

        loop {
            let class = match self.attempt(&url, endpoint, page_size, cursor.as_ref()).await {
                Ok(page) => {
                    if state != AttemptState::default() {
                        debug!(
                            transient_failures = state.transient_failures,
                            rate_limit_waits = state.rate_limit_waits,
                            "Fetch recovered"
                        );
                    }
                    return Ok(page);
                },
                Err(class) => class,
            };

            match self
                .policy
                .decide(class, endpoint, cursor.is_some(), &mut state)
            {
                RetryAction::Fail(err) => return Err(err),
                RetryAction::ClearCursor => {
                    warn!(
                        cursor = ?cursor.as_ref().map(CursorToken::as_str),
                        "Source rejected cursor; restarting from the head of the collection, \
                         destination dedup absorbs the overlap"
                    );
                    cursor = None;
                },
                RetryAction::Wait(delay) => {
                    warn!(
                        endpoint = endpoint.as_str(),
                        wait_ms = delay.as_millis() as u64,
                        waits = state.rate_limit_waits,
                        "Rate limited by source"
                    );
                    self.pause(delay).await?;
                },
                RetryAction::Backoff { retry, delay } => {
                    warn!(
                        retry,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, backing off"
                    );
                    self.pause(delay).await?;
                },
            }
        }
    }

    fn is_privileged(&self) -> bool {
        self.endpoint() == Endpoint::Privileged
    }
}
