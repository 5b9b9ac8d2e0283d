//! Run artifact storage, HTTP fetch utilities and the product store gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use shelfsync_core::{Locale, PipelineError, RateBudget, TokenBudgetSnapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod products;

pub use products::{MemoryProductStore, PgProductStore, ProductStore, StoredProduct};

pub const CRATE_NAME: &str = "shelfsync-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Per-run artifacts named by locale and purpose. Each write replaces the previous one.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_name(locale: Locale, purpose: &str, extension: &str) -> String {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        format!("{}_{}.{}", locale.code(), purpose, ext)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write bytes under `name` via temp file + rename. Identical content is left in place.
    pub async fn store_named(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = PathBuf::from(name);
        let absolute_path = self.root.join(&relative_path);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    pub async fn read_named(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.root.join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading artifact {}", path.display())),
        }
    }

    /// One identifier per line, in rank order.
    pub async fn store_lines(&self, name: &str, lines: &[String]) -> anyhow::Result<StoredArtifact> {
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        self.store_named(name, text.as_bytes()).await
    }

    pub async fn read_lines(&self, name: &str) -> anyhow::Result<Option<Vec<String>>> {
        let Some(bytes) = self.read_named(name).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).with_context(|| format!("decoding artifact {name}"))?;
        Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt; for calls whose failures must surface immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_endpoint_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_endpoint_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The API's token bucket as last reported, shared by the client and the scheduler.
#[derive(Debug)]
pub struct SharedBudget {
    state: Mutex<RateBudget>,
}

impl SharedBudget {
    pub fn new(initial: RateBudget) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    pub async fn observe(&self, tokens_left: f64, refill_per_minute: f64, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.observe(tokens_left, refill_per_minute, at);
    }

    /// Reserves `cost` against the balance until the next observation replaces it.
    pub async fn debit(&self, cost: f64, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.refill(now);
        state.debit(cost);
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> TokenBudgetSnapshot {
        self.state.lock().await.snapshot(now)
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_endpoint_limit: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("fetcher shut down")]
    Closed,
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_endpoint_limit: config.per_endpoint_concurrency.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn endpoint_semaphore(&self, endpoint: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
            .clone()
    }

    /// GET `url`, retrying transient failures per the configured backoff policy. `endpoint` names
    /// the call in logs and errors; the URL itself carries the API key and is never logged.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_with(run_id, endpoint, url, self.backoff).await
    }

    /// Same as [`HttpFetcher::fetch_bytes`] with an explicit policy for this call.
    pub async fn fetch_bytes_with(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
        backoff: BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_endpoint = self.endpoint_semaphore(endpoint).await;
        let _endpoint = per_endpoint.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, endpoint);
        self.fetch_with_retries(endpoint, url, backoff).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        endpoint: &str,
        url: &str,
        backoff: BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|err| FetchError::Request {
                            endpoint: endpoint.to_string(),
                            source: err.without_url(),
                        })?;
                        return Ok(FetchedResponse {
                            status,
                            body: body.to_vec(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(attempt, "retrying after request error");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        endpoint: endpoint.to_string(),
                        source: err.without_url(),
                    });
                }
            }
        }
    }
}
