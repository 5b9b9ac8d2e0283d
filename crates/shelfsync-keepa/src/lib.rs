//! Data API contract, its HTTP implementation, and the response parsers.

pub mod parse;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shelfsync_core::{Locale, PipelineError, RateBudget, TokenBudgetSnapshot};
use shelfsync_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, SharedBudget};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelfsync-keepa";
pub const DEFAULT_BASE_URL: &str = "https://api.keepa.com";

/// Stats window for the competitive-offer call.
pub const STATS_WINDOW_COMPETITIVE: u32 = 90;
/// Stats window for the detail call.
pub const STATS_WINDOW_DETAIL: u32 = 30;
pub const DEFAULT_OFFERS: u32 = 40;

/// Parsed body plus the exact bytes received, which callers keep as an audit artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub body: JsonValue,
    pub raw: Vec<u8>,
}

impl ApiReply {
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, PipelineError> {
        let body = parse::parse_json(&raw)?;
        Ok(Self { body, raw })
    }

    pub fn from_json(body: JsonValue) -> Self {
        let raw = serde_json::to_vec(&body).unwrap_or_default();
        Self { body, raw }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRequest {
    pub stats_days: u32,
    pub offers: Option<u32>,
    pub stock: bool,
    pub asins: Vec<String>,
}

impl DetailRequest {
    pub fn competitive_stats(asins: Vec<String>, offers: u32) -> Self {
        Self {
            stats_days: STATS_WINDOW_COMPETITIVE,
            offers: Some(offers),
            stock: false,
            asins,
        }
    }

    pub fn detail(asins: Vec<String>, offers: u32) -> Self {
        Self {
            stats_days: STATS_WINDOW_DETAIL,
            offers: Some(offers),
            stock: true,
            asins,
        }
    }
}

/// Operations the pipeline needs from the external catalog API.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn fetch_best_sellers(&self, locale: Locale, node_id: u64) -> Result<ApiReply, PipelineError>;

    async fn fetch_product_details(
        &self,
        locale: Locale,
        request: &DetailRequest,
    ) -> Result<ApiReply, PipelineError>;

    /// Display name of the seller, or `None` when the lookup returned no sellers.
    async fn fetch_seller_info(&self, locale: Locale, seller_id: &str) -> Result<Option<String>, PipelineError>;

    /// Ask the API for its current token status and fold it into the local budget.
    async fn refresh_token_status(&self) -> Result<TokenBudgetSnapshot, PipelineError>;

    /// Advisory view of the budget as last observed, projected to now.
    async fn token_budget(&self) -> TokenBudgetSnapshot;

    /// Counts `cost` as spent until the API reports a fresh balance.
    async fn reserve_tokens(&self, cost: f64);
}

#[derive(Clone)]
pub struct KeepaConfig {
    pub api_key: String,
    pub base_url: String,
    pub http: HttpClientConfig,
}

impl KeepaConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

impl fmt::Debug for KeepaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepaConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("http", &self.http)
            .finish()
    }
}

fn base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

pub fn best_sellers_url(base_url: &str, api_key: &str, locale: Locale, node_id: u64) -> String {
    format!(
        "{}/bestsellers?key={}&domain={}&category={node_id}",
        base(base_url),
        urlencoding::encode(api_key),
        locale.domain_id(),
    )
}

pub fn product_url(base_url: &str, api_key: &str, locale: Locale, request: &DetailRequest) -> String {
    let asins = request
        .asins
        .iter()
        .map(|a| urlencoding::encode(a).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    let mut url = format!(
        "{}/product?key={}&domain={}&asin={asins}&stats={}",
        base(base_url),
        urlencoding::encode(api_key),
        locale.domain_id(),
        request.stats_days,
    );
    if let Some(offers) = request.offers {
        url.push_str(&format!("&offers={offers}"));
    }
    if request.stock {
        url.push_str("&stock=1");
    }
    url
}

pub fn seller_url(base_url: &str, api_key: &str, locale: Locale, seller_id: &str) -> String {
    format!(
        "{}/seller?key={}&domain={}&seller={}",
        base(base_url),
        urlencoding::encode(api_key),
        locale.domain_id(),
        urlencoding::encode(seller_id),
    )
}

pub fn token_url(base_url: &str, api_key: &str) -> String {
    format!("{}/token?key={}", base(base_url), urlencoding::encode(api_key))
}

#[derive(Debug)]
pub struct KeepaClient {
    config: KeepaConfig,
    http: HttpFetcher,
    budget: Arc<SharedBudget>,
    run_id: Uuid,
}

impl KeepaClient {
    pub fn new(config: KeepaConfig, budget: Arc<SharedBudget>) -> Result<Self, PipelineError> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Configuration("API key is empty".into()));
        }
        let http = HttpFetcher::new(config.http.clone())
            .map_err(|e| PipelineError::Configuration(format!("http client: {e:#}")))?;
        Ok(Self {
            config,
            http,
            budget,
            run_id: Uuid::new_v4(),
        })
    }

    /// Client with a fresh budget assumed full until the first response says otherwise.
    pub fn with_default_budget(config: KeepaConfig) -> Result<Self, PipelineError> {
        Self::new(config, Arc::new(SharedBudget::new(RateBudget::full(Utc::now()))))
    }

    pub fn budget(&self) -> Arc<SharedBudget> {
        self.budget.clone()
    }

    /// Calls that spend tokens go out once; a failure is reported to the caller as is.
    async fn get(&self, endpoint: &str, url: &str) -> Result<ApiReply, PipelineError> {
        self.get_with(endpoint, url, BackoffPolicy::none()).await
    }

    async fn get_with(&self, endpoint: &str, url: &str, backoff: BackoffPolicy) -> Result<ApiReply, PipelineError> {
        let response = self.http.fetch_bytes_with(self.run_id, endpoint, url, backoff).await?;
        let reply = ApiReply::from_bytes(response.body)?;
        self.observe_tokens(endpoint, &reply.body).await;
        if let Some(message) = parse::api_error(&reply.body) {
            return Err(PipelineError::Transport(format!("{endpoint}: {message}")));
        }
        Ok(reply)
    }

    async fn observe_tokens(&self, endpoint: &str, body: &JsonValue) {
        match parse::token_status(body) {
            Some((tokens_left, refill_rate)) => {
                debug!(endpoint, tokens_left, refill_rate, "token status observed");
                self.budget.observe(tokens_left, refill_rate, Utc::now()).await;
            }
            None => warn!(endpoint, "response carried no token status"),
        }
    }
}

#[async_trait]
impl CatalogApi for KeepaClient {
    async fn fetch_best_sellers(&self, locale: Locale, node_id: u64) -> Result<ApiReply, PipelineError> {
        let url = best_sellers_url(&self.config.base_url, &self.config.api_key, locale, node_id);
        self.get("bestsellers", &url).await
    }

    async fn fetch_product_details(
        &self,
        locale: Locale,
        request: &DetailRequest,
    ) -> Result<ApiReply, PipelineError> {
        if request.asins.is_empty() {
            return Err(PipelineError::Configuration("product request without identifiers".into()));
        }
        let url = product_url(&self.config.base_url, &self.config.api_key, locale, request);
        self.get("product", &url).await
    }

    async fn fetch_seller_info(&self, locale: Locale, seller_id: &str) -> Result<Option<String>, PipelineError> {
        let url = seller_url(&self.config.base_url, &self.config.api_key, locale, seller_id);
        let reply = self.get("seller", &url).await?;
        Ok(parse::seller_name(&reply.body))
    }

    async fn refresh_token_status(&self) -> Result<TokenBudgetSnapshot, PipelineError> {
        let url = token_url(&self.config.base_url, &self.config.api_key);
        // Token status is free, so transient failures use the configured retries.
        let reply = self.get_with("token", &url, self.config.http.backoff).await?;
        if parse::token_status(&reply.body).is_none() {
            return Err(PipelineError::MalformedResponse(
                "token status response lacks tokensLeft/refillRate".into(),
            ));
        }
        Ok(self.budget.snapshot(Utc::now()).await)
    }

    async fn token_budget(&self) -> TokenBudgetSnapshot {
        self.budget.snapshot(Utc::now()).await
    }

    async fn reserve_tokens(&self, cost: f64) {
        self.budget.debit(cost, Utc::now()).await;
    }
}
