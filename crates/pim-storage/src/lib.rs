//! Rate-limited HTTP transport and persistence port for the issue miner.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{Store, StoreError};

pub const CRATE_NAME: &str = "pim-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Seconds form of `Retry-After`. HTTP-date values are not honoured.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per call, first try included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Wait after a 429: the server's `Retry-After` when given, else the backoff
    /// delay, never longer than `max_delay`.
    pub fn rate_limited_wait(&self, retry_after: Option<Duration>, attempt_index: usize) -> Duration {
        retry_after
            .unwrap_or_else(|| self.delay_for_attempt(attempt_index))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: usize) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

/// Request budget over a sliding window shared by every caller of one client.
///
/// Check and record happen under the same lock, so concurrent callers can never
/// push the window past `capacity`.
#[derive(Debug)]
pub struct RollingWindowBudget {
    capacity: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RollingWindowBudget {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.max_requests.max(1),
            window: config.window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits until a permit is free, records it, and returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let mut issued = self.issued.lock().await;
            let now = Instant::now();
            while issued
                .front()
                .is_some_and(|at| now.duration_since(*at) >= self.window)
            {
                issued.pop_front();
            }

            if issued.len() < self.capacity {
                issued.push_back(now);
                return now.duration_since(started);
            }

            let oldest = issued.front().copied().unwrap_or(now);
            let sleep_for = (oldest + self.window).saturating_duration_since(now);
            drop(issued);
            warn!(
                capacity = self.capacity,
                wait_ms = sleep_for.as_millis() as u64,
                "request budget exhausted; waiting for the window to roll"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Permits currently counted against the window.
    pub async fn in_window(&self) -> usize {
        let mut issued = self.issued.lock().await;
        let now = Instant::now();
        issued.retain(|at| now.duration_since(*at) < self.window);
        issued.len()
    }
}

#[derive(Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    Header { name: &'static str, value: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth: Option<Auth>,
    pub extra_headers: Vec<(&'static str, String)>,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitConfig,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: Some("product-issue-miner/0.1".to_string()),
            auth: None,
            extra_headers: Vec::new(),
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitConfig::per_minute(700),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit still exceeded after {attempts} attempts (last retry-after {retry_after:?})")]
    RateLimitExceeded {
        attempts: usize,
        retry_after: Duration,
    },
    #[error("transient API failure after {attempts} attempts: {detail}")]
    TransientApi { attempts: usize, detail: String },
    #[error("http status {status} for {url}: {body}")]
    ClientRequest {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("undecodable response from {url}: {detail}")]
    Decode { url: String, detail: String },
}

impl ApiError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientRequest { .. })
    }
}

/// JSON-over-HTTP client that spends one budget permit per attempt and retries
/// 429 and 5xx/network failures with bounded attempts.
#[derive(Debug, Clone)]
pub struct RateLimitedHttpClient {
    client: reqwest::Client,
    base_url: Url,
    auth: Option<Auth>,
    budget: Arc<RollingWindowBudget>,
    backoff: BackoffPolicy,
}

impl RateLimitedHttpClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        for (name, value) in &config.extra_headers {
            headers.insert(
                *name,
                value
                    .parse()
                    .with_context(|| format!("invalid value for header {name}"))?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base).with_context(|| format!("parsing base url {base}"))?;

        Ok(Self {
            client,
            base_url,
            auth: config.auth,
            budget: Arc::new(RollingWindowBudget::new(config.rate_limit)),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn budget(&self) -> &RollingWindowBudget {
        &self.budget
    }

    /// Resolves a relative path against the base url; absolute urls (pagination links) pass through.
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, ApiError> {
        if let Ok(url) = Url::parse(path_or_url) {
            return Ok(url);
        }
        self.base_url
            .join(path_or_url.trim_start_matches('/'))
            .map_err(|_| ApiError::InvalidUrl(path_or_url.to_string()))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send_json::<(), T>(Method::GET, path, query, None).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(Method::POST, path, &[], Some(body)).await
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let url = self.resolve(path)?;
        let span = info_span!("http_request", %method, path = url.path());
        self.send_with_retries(method, url, query, body)
            .instrument(span)
            .await
    }

    async fn send_with_retries<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let waited = self.budget.acquire().await;
            if !waited.is_zero() {
                debug!(waited_ms = waited.as_millis() as u64, "budget permit granted");
            }

            let mut request = self.client.request(method.clone(), url.clone());
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            request = match &self.auth {
                Some(Auth::Basic { username, password }) => {
                    request.basic_auth(username, Some(password))
                }
                Some(Auth::Header { name, value }) => request.header(*name, value),
                None => request,
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<T>().await.map_err(|err| ApiError::Decode {
                            url: url.to_string(),
                            detail: err.to_string(),
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::RateLimited => {
                            let wait = self
                                .backoff
                                .rate_limited_wait(retry_after(resp.headers()), attempt - 1);
                            if attempt >= max_attempts {
                                return Err(ApiError::RateLimitExceeded {
                                    attempts: attempt,
                                    retry_after: wait,
                                });
                            }
                            warn!(attempt, wait_secs = wait.as_secs_f64(), "rate limited (429); retrying");
                            tokio::time::sleep(wait).await;
                        }
                        RetryDisposition::Retryable => {
                            if attempt >= max_attempts {
                                let body = resp.text().await.unwrap_or_default();
                                return Err(ApiError::TransientApi {
                                    attempts: attempt,
                                    detail: format!("http status {status}: {}", truncate(&body, 200)),
                                });
                            }
                            let wait = self.backoff.delay_for_attempt(attempt - 1);
                            warn!(attempt, %status, wait_secs = wait.as_secs_f64(), "server error; retrying");
                            tokio::time::sleep(wait).await;
                        }
                        RetryDisposition::NonRetryable => {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(ApiError::ClientRequest {
                                status: status.as_u16(),
                                url: url.to_string(),
                                body: truncate(&body, 500),
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(ApiError::Request(err));
                    }
                    if attempt >= max_attempts {
                        return Err(ApiError::TransientApi {
                            attempts: attempt,
                            detail: err.to_string(),
                        });
                    }
                    let wait = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, error = %err, wait_secs = wait.as_secs_f64(), "request failed; retrying");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
