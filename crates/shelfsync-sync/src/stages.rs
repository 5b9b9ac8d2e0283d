//! Catalog discovery, the two-call fetch per batch, and per-item enrichment.

use std::sync::Arc;

use shelfsync_core::transform::SELLER_UNKNOWN;
use shelfsync_core::{
    enrich, to_persisted, Batch, CandidateList, CompetitiveSnapshot, DetailRecord, Locale, PipelineError,
};
use shelfsync_keepa::{parse, CatalogApi, DetailRequest};
use shelfsync_storage::{ArtifactStore, ProductStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::progress::ProgressSink;

pub const BESTSELLERS_ARTIFACT: &str = "bestsellers";
pub const ASIN_LIST_ARTIFACT: &str = "asin_list";
pub const STAGE1_ARTIFACT: &str = "stage1_stats90";
pub const STAGE2_ARTIFACT: &str = "stage2_detail30";

/// Artifacts are an audit trail; a failed write is reported and otherwise ignored.
async fn write_artifact(
    artifacts: &ArtifactStore,
    sink: &dyn ProgressSink,
    locale: Locale,
    name: &str,
    bytes: &[u8],
) {
    match artifacts.store_named(name, bytes).await {
        Ok(stored) => debug!(
            artifact = name,
            bytes = stored.byte_size,
            unchanged = stored.unchanged,
            "artifact written"
        ),
        Err(err) => sink.warn(locale, &format!("Could not write {name}: {err:#}")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOutcome {
    Candidates(CandidateList),
    /// The best-seller response carried no list; the run ends with nothing processed.
    Empty,
}

pub struct CatalogFetcher {
    api: Arc<dyn CatalogApi>,
    artifacts: ArtifactStore,
    sink: Arc<dyn ProgressSink>,
    max_asins: usize,
}

impl CatalogFetcher {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        artifacts: ArtifactStore,
        sink: Arc<dyn ProgressSink>,
        max_asins: usize,
    ) -> Self {
        Self {
            api,
            artifacts,
            sink,
            max_asins,
        }
    }

    pub async fn fetch(&self, locale: Locale, node_id: u64) -> Result<CatalogOutcome, PipelineError> {
        let reply = self.api.fetch_best_sellers(locale, node_id).await?;
        let raw_name = ArtifactStore::artifact_name(locale, BESTSELLERS_ARTIFACT, "json");
        write_artifact(&self.artifacts, self.sink.as_ref(), locale, &raw_name, &reply.raw).await;

        let Some(ranked) = parse::best_seller_asins(&reply.body)? else {
            self.sink.warn(locale, "Best-seller list is empty; nothing to process");
            return Ok(CatalogOutcome::Empty);
        };
        let candidates = CandidateList::from_ranked(locale, ranked, self.max_asins);

        let list_name = ArtifactStore::artifact_name(locale, ASIN_LIST_ARTIFACT, "txt");
        if let Err(err) = self.artifacts.store_lines(&list_name, &candidates.asins).await {
            self.sink.warn(locale, &format!("Could not write {list_name}: {err:#}"));
        }
        self.sink.info(
            locale,
            &format!("Fetched {} best sellers for node {node_id}", candidates.len()),
        );
        Ok(Self::outcome(candidates))
    }

    /// Reads the identifier list written by an earlier run instead of calling the API.
    pub async fn reuse(&self, locale: Locale) -> Result<CatalogOutcome, PipelineError> {
        let name = ArtifactStore::artifact_name(locale, ASIN_LIST_ARTIFACT, "txt");
        let lines = self
            .artifacts
            .read_lines(&name)
            .await
            .map_err(|err| PipelineError::Configuration(format!("reading {name}: {err:#}")))?
            .ok_or_else(|| PipelineError::Configuration(format!("no saved identifier list {name}")))?;
        let candidates = CandidateList::from_ranked(locale, lines, self.max_asins);
        self.sink.info(locale, &format!("Reusing {} saved identifiers", candidates.len()));
        Ok(Self::outcome(candidates))
    }

    fn outcome(candidates: CandidateList) -> CatalogOutcome {
        if candidates.is_empty() {
            CatalogOutcome::Empty
        } else {
            CatalogOutcome::Candidates(candidates)
        }
    }
}

/// Result of both fetch calls for one batch, reconciled against the batch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchFetch {
    pub snapshot: CompetitiveSnapshot,
    /// In batch order.
    pub details: Vec<DetailRecord>,
    /// Absent from the detail response.
    pub missing: Vec<String>,
    /// Present but unreadable.
    pub malformed: Vec<(String, PipelineError)>,
}

pub struct DependentFetchStage {
    api: Arc<dyn CatalogApi>,
    artifacts: ArtifactStore,
    sink: Arc<dyn ProgressSink>,
    offers: u32,
}

impl DependentFetchStage {
    pub fn new(api: Arc<dyn CatalogApi>, artifacts: ArtifactStore, sink: Arc<dyn ProgressSink>, offers: u32) -> Self {
        Self {
            api,
            artifacts,
            sink,
            offers,
        }
    }

    /// Any error returned here abandons the whole batch.
    pub async fn run(&self, locale: Locale, batch: &Batch) -> Result<BatchFetch, PipelineError> {
        let snapshot = self.competitive_stats(locale, batch).await?;

        let requested: Vec<String> = snapshot
            .identifiers()
            .into_iter()
            .filter(|a| !a.is_empty())
            .collect();
        if requested.is_empty() {
            return Ok(BatchFetch {
                snapshot,
                missing: batch.asins.clone(),
                ..BatchFetch::default()
            });
        }

        let request = DetailRequest::detail(requested, self.offers);
        let reply = self.api.fetch_product_details(locale, &request).await?;
        let name = ArtifactStore::artifact_name(locale, STAGE2_ARTIFACT, "json");
        write_artifact(&self.artifacts, self.sink.as_ref(), locale, &name, &reply.raw).await;

        let products = parse::products_array(&reply.body)?;
        let by_asin = parse::index_by_asin(products);

        let mut fetch = BatchFetch {
            snapshot,
            ..BatchFetch::default()
        };
        for asin in &batch.asins {
            match by_asin.get(asin.as_str()) {
                None => fetch.missing.push(asin.clone()),
                Some(product) => match parse::detail_record(product) {
                    Ok(record) => fetch.details.push(record),
                    Err(err) => fetch.malformed.push((asin.clone(), err)),
                },
            }
        }
        Ok(fetch)
    }

    async fn competitive_stats(&self, locale: Locale, batch: &Batch) -> Result<CompetitiveSnapshot, PipelineError> {
        let request = DetailRequest::competitive_stats(batch.asins.clone(), self.offers);
        let reply = self.api.fetch_product_details(locale, &request).await?;
        let name = ArtifactStore::artifact_name(locale, STAGE1_ARTIFACT, "json");
        write_artifact(&self.artifacts, self.sink.as_ref(), locale, &name, &reply.raw).await;
        Ok(parse::competitive_snapshot(parse::products_array(&reply.body)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub stored: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Fans one batch's records out to bounded concurrent tasks and joins them all.
pub struct EnrichmentWorker {
    api: Arc<dyn CatalogApi>,
    store: Arc<dyn ProductStore>,
    sink: Arc<dyn ProgressSink>,
    limit: Arc<Semaphore>,
}

impl EnrichmentWorker {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        store: Arc<dyn ProductStore>,
        sink: Arc<dyn ProgressSink>,
        concurrency: usize,
    ) -> Self {
        Self {
            api,
            store,
            sink,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub async fn process(&self, locale: Locale, details: Vec<DetailRecord>, snapshot: &CompetitiveSnapshot) -> BatchTally {
        let mut tasks = JoinSet::new();
        for detail in details {
            let winner_count_90 = snapshot.count_for(&detail.asin);
            let api = self.api.clone();
            let store = self.store.clone();
            let sink = self.sink.clone();
            let limit = self.limit.clone();
            tasks.spawn(async move {
                let asin = detail.asin.clone();
                let _permit = limit.acquire_owned().await.ok();
                let seller_name = resolve_seller(api.as_ref(), sink.as_ref(), locale, &detail).await;
                let product = to_persisted(&enrich(detail, winner_count_90, seller_name));
                let stored = store.upsert(locale, &product).await;
                (asin, stored)
            });
        }

        let mut tally = BatchTally::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => tally.stored += 1,
                Ok((asin, Err(err))) => {
                    self.sink.error(locale, &format!("Failed to store {asin}: {err}"));
                    tally.failed += 1;
                    tally.errors.push(format!("{asin}: {err}"));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "enrichment task did not complete");
                    self.sink.error(locale, &format!("Enrichment task aborted: {join_err}"));
                    tally.failed += 1;
                    tally.errors.push(format!("task: {join_err}"));
                }
            }
        }
        tally
    }
}

/// Seller display name for the record's current buy-box holder; "N/A" when unknown or unavailable.
pub async fn resolve_seller(
    api: &dyn CatalogApi,
    sink: &dyn ProgressSink,
    locale: Locale,
    detail: &DetailRecord,
) -> String {
    let Some(seller_id) = detail.current_seller_id() else {
        return SELLER_UNKNOWN.to_string();
    };
    match api.fetch_seller_info(locale, seller_id).await {
        Ok(Some(name)) => name,
        Ok(None) => SELLER_UNKNOWN.to_string(),
        Err(err) => {
            sink.warn(
                locale,
                &format!("Seller lookup for {} ({seller_id}) failed: {err}", detail.asin),
            );
            SELLER_UNKNOWN.to_string()
        }
    }
}
