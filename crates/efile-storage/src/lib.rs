//! Remote document retrieval plus the on-disk layout of a run's working directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub mod layout;

pub use layout::{
    checkpoint_file_name, commit_temp, manifest_years, parse_checkpoint_ordinal, remove_if_exists,
    sha256_file, sha256_hex, temp_sibling, write_atomic, YearLayout,
};

/// Body of a fetched document, or the marker for a resource the index lists
/// but the remote does not serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentResponse {
    Found(Vec<u8>),
    Missing,
}

impl DocumentResponse {
    pub fn byte_len(&self) -> usize {
        match self {
            DocumentResponse::Found(body) => body.len(),
            DocumentResponse::Missing => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    Document,
    Missing,
    Unexpected,
}

pub fn classify_status(status: StatusCode) -> StatusDisposition {
    match status {
        StatusCode::OK => StatusDisposition::Document,
        StatusCode::NOT_FOUND => StatusDisposition::Missing,
        _ => StatusDisposition::Unexpected,
    }
}

/// Faults that invalidate the whole group a document belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("unexpected http status {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },
}

pub fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Anything that can serve manifest-referenced documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, url: &str) -> Result<DocumentResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_idle_per_host: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_idle_per_host: 50,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(1) / requests,
        }
    }
}

/// Request rate cap shared by every task fetching through one `HttpFetcher`.
#[derive(Debug)]
pub struct RequestThrottle {
    config: TokenBucketConfig,
    permits: Mutex<Permits>,
}

#[derive(Debug)]
struct Permits {
    available: u32,
    refilled_at: Instant,
}

impl RequestThrottle {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            permits: Mutex::new(Permits {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn per_second(requests: u32) -> Self {
        Self::new(TokenBucketConfig::per_second(requests))
    }

    /// Waits until one more request may go out.
    pub async fn acquire(&self) {
        loop {
            let ready_at = {
                let mut permits = self.permits.lock().await;
                permits.refill(self.config, Instant::now());
                if permits.available > 0 {
                    permits.available -= 1;
                    return;
                }
                permits.refilled_at + self.config.refill_every
            };
            tokio::time::sleep_until(ready_at).await;
        }
    }
}

impl Permits {
    /// Credits whole refill periods since the last refill. A partial period
    /// carries over; a full bucket does not bank idle time.
    fn refill(&mut self, config: TokenBucketConfig, now: Instant) {
        let period = config.refill_every.as_nanos();
        if self.available >= config.capacity || period == 0 {
            self.available = config.capacity;
            self.refilled_at = now;
            return;
        }
        let periods = now.saturating_duration_since(self.refilled_at).as_nanos() / period;
        if periods == 0 {
            return;
        }
        let missing = config.capacity - self.available;
        match u32::try_from(periods) {
            Ok(credited) if credited < missing => {
                self.available += credited;
                self.refilled_at += config.refill_every * credited;
            }
            _ => {
                self.available = config.capacity;
                self.refilled_at = now;
            }
        }
    }
}

/// One shared connection pool for every request of a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: Option<Arc<RequestThrottle>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let throttle = config
            .token_bucket
            .map(|limits| Arc::new(RequestThrottle::new(limits)));

        Ok(Self { client, throttle })
    }
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch_document(&self, url: &str) -> Result<DocumentResponse, FetchError> {
        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, &err))?;
        let status = resp.status();

        match classify_status(status) {
            StatusDisposition::Document => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|err| classify_reqwest_error(url, &err))?;
                Ok(DocumentResponse::Found(body.to_vec()))
            }
            StatusDisposition::Missing => {
                debug!(url, "remote index lists a document the server does not have");
                Ok(DocumentResponse::Missing)
            }
            StatusDisposition::Unexpected => Err(FetchError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}
