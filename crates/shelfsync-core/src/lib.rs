//! Core domain model, error taxonomy and pure accounting for the best-seller ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod budget;
pub mod transform;

pub use budget::{plan_token_usage, LocaleLoad, PlannerSettings, RateBudget, TokenBudgetSnapshot, TokenUsagePlan};
pub use transform::{enrich, to_persisted, transform};

pub const CRATE_NAME: &str = "shelfsync-core";

/// Marketplace the pipeline runs against. Selects the category root, output table and log tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Locale {
    #[serde(rename = "DE", alias = "de")]
    De,
    #[serde(rename = "FR", alias = "fr")]
    Fr,
    #[serde(rename = "IT", alias = "it")]
    It,
    #[serde(rename = "ES", alias = "es")]
    Es,
}

impl Locale {
    pub const ALL: [Locale; 4] = [Locale::De, Locale::Fr, Locale::It, Locale::Es];

    pub fn code(self) -> &'static str {
        match self {
            Locale::De => "DE",
            Locale::Fr => "FR",
            Locale::It => "IT",
            Locale::Es => "ES",
        }
    }

    /// Numeric marketplace id used by the data API.
    pub fn domain_id(self) -> u8 {
        match self {
            Locale::De => 3,
            Locale::Fr => 4,
            Locale::It => 8,
            Locale::Es => 9,
        }
    }

    /// Per-locale partition table, e.g. `products_it`.
    pub fn table_name(self) -> String {
        format!("products_{}", self.code().to_ascii_lowercase())
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Locale {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DE" => Ok(Locale::De),
            "FR" => Ok(Locale::Fr),
            "IT" => Ok(Locale::It),
            "ES" => Ok(Locale::Es),
            other => Err(PipelineError::Configuration(format!("unknown locale {other:?}"))),
        }
    }
}

/// Failure taxonomy shared by every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transport(_) => "TransportError",
            PipelineError::MalformedResponse(_) => "MalformedResponse",
            PipelineError::Persistence(_) => "PersistenceError",
            PipelineError::Configuration(_) => "ConfigurationError",
        }
    }
}

/// Ranked identifiers discovered for one locale, truncated to the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateList {
    pub locale: Locale,
    pub asins: Vec<String>,
}

impl CandidateList {
    pub const DEFAULT_MAX: usize = 1000;

    pub fn from_ranked(locale: Locale, ranked: impl IntoIterator<Item = String>, max: usize) -> Self {
        let asins = ranked
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .take(max)
            .collect();
        Self { locale, asins }
    }

    pub fn len(&self) -> usize {
        self.asins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asins.is_empty()
    }

    /// Lowest-ranked first: the list is walked back to front.
    pub fn processing_order(&self) -> Vec<String> {
        self.asins.iter().rev().cloned().collect()
    }

    pub fn batches(&self, batch_size: usize) -> Vec<Batch> {
        partition_batches(&self.processing_order(), batch_size)
    }
}

/// Contiguous slice of the processing order; the unit of pacing and API interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub asins: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.asins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asins.is_empty()
    }

    pub fn label(&self) -> String {
        format!("batch {} [{}]", self.index + 1, self.asins.join(","))
    }
}

/// Splits `ids` into `ceil(len / size)` ordered, non-overlapping batches. A zero size is treated as one.
pub fn partition_batches(ids: &[String], batch_size: usize) -> Vec<Batch> {
    ids.chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            asins: chunk.to_vec(),
        })
        .collect()
}

/// Identifier to competing buy-box offer count, in stage-1 response order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitiveSnapshot {
    entries: Vec<(String, u32)>,
}

impl CompetitiveSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asin: impl Into<String>, count: u32) {
        let asin = asin.into();
        match self.entries.iter_mut().find(|(a, _)| *a == asin) {
            Some(entry) => entry.1 = count,
            None => self.entries.push((asin, count)),
        }
    }

    pub fn count_for(&self, asin: &str) -> u32 {
        self.entries
            .iter()
            .find(|(a, _)| a == asin)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.entries.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Structured view of one product from the 30-day detail call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub asin: String,
    pub title: String,
    pub brand: String,
    pub product_type: String,
    pub ean_list: Option<Vec<String>>,
    pub monthly_sold: i32,
    pub current: Vec<f64>,
    pub avg30: Vec<f64>,
    /// Number of keys in the detail response's own buy-box stats (30-day window).
    pub buy_box_winner_count: u32,
    pub stock_amazon: i32,
    /// Minor units.
    pub buy_box_price: i64,
    /// Minor units.
    pub pick_and_pack_fee: f64,
    pub referral_fee_percentage: f64,
    pub buy_box_eligible_offer_counts: Vec<i64>,
    pub buy_box_seller_id_history: Vec<String>,
}

impl DetailRecord {
    /// Most recent buy-box holder, if any history was returned.
    pub fn current_seller_id(&self) -> Option<&str> {
        self.buy_box_seller_id_history
            .last()
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Detail record with its enrichment results; the pre-persistence shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub detail: DetailRecord,
    pub seller_name: String,
    pub winner_count_30: u32,
    pub winner_count_90: u32,
}

/// Row shape written to the locale table, keyed by `asin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProduct {
    pub asin: String,
    pub title: String,
    pub sales_current: f64,
    pub sales_avg30: f64,
    pub monthly_sold: i32,
    pub buy_box_shipping_current: f64,
    pub buy_box_shipping_avg30: f64,
    pub seller_name: String,
    pub winner_count_30: i32,
    pub winner_count_90: i32,
    pub buy_box_eligible_offer_count: i32,
    /// `None` when the source reports stock as untracked.
    pub stock_amazon: Option<i32>,
    pub new_price_current: f64,
    pub new_price_avg30: f64,
    pub fba_fees: f64,
    pub referral_fee_percentage: f64,
    pub referral_buybox_fee: f64,
    pub ean_list: String,
    pub product_type: String,
    pub brand: String,
}

/// Outcome of one `run_pipeline` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub locale: Locale,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub batches_total: usize,
    pub batches_completed: usize,
    pub batches_abandoned: usize,
    pub items_processed: usize,
    pub items_skipped: usize,
    /// Items left in batches that a stop request prevented from starting.
    pub items_not_started: usize,
    pub stale_rows_deleted: u64,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn started(locale: Locale) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            locale,
            started_at: now,
            finished_at: now,
            candidates: 0,
            batches_total: 0,
            batches_completed: 0,
            batches_abandoned: 0,
            items_processed: 0,
            items_skipped: 0,
            items_not_started: 0,
            stale_rows_deleted: 0,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, context: &str, err: &PipelineError) {
        self.errors.push(format!("{context}: {err}"));
    }

    /// Every candidate ends up processed, skipped or not started.
    pub fn items_accounted(&self) -> usize {
        self.items_processed + self.items_skipped + self.items_not_started
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}
