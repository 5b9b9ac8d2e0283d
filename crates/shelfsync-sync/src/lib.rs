//! Best-seller ingestion pipeline: catalog discovery, paced batches, enrichment and persistence.

pub mod config;
pub mod progress;
pub mod scheduler;
pub mod stages;

use std::sync::Arc;

use shelfsync_core::{Locale, PipelineError, RunSummary};
use shelfsync_keepa::{CatalogApi, KeepaClient};
use shelfsync_storage::{ArtifactStore, MemoryProductStore, ProductStore};
use tracing::{info_span, warn, Instrument};

pub use config::{LocaleEntry, LocaleRegistry, SyncConfig};
pub use progress::{FileSink, LineLevel, MemorySink, ProgressLine, ProgressSink, TeeSink, TracingSink};
pub use scheduler::{BatchScheduler, SchedulerSettings, StopSignal};
pub use stages::{BatchFetch, CatalogFetcher, CatalogOutcome, DependentFetchStage, EnrichmentWorker};

pub const CRATE_NAME: &str = "shelfsync-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Use the identifier list saved by a previous run instead of calling best sellers.
    pub reuse_list: bool,
    /// Write to an in-process store instead of PostgreSQL.
    pub dry_run: bool,
}

pub struct IngestPipeline {
    config: SyncConfig,
    registry: LocaleRegistry,
    api: Arc<dyn CatalogApi>,
    store: Arc<dyn ProductStore>,
    sink: Arc<dyn ProgressSink>,
    reuse_list: bool,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        registry: LocaleRegistry,
        api: Arc<dyn CatalogApi>,
        store: Arc<dyn ProductStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            registry,
            api,
            store,
            sink,
            reuse_list: false,
        }
    }

    pub fn reuse_list(mut self, reuse: bool) -> Self {
        self.reuse_list = reuse;
        self
    }

    pub fn api(&self) -> Arc<dyn CatalogApi> {
        self.api.clone()
    }

    /// Runs one locale to completion or until `stop` is observed at a batch boundary.
    pub async fn run(&self, locale: Locale, stop: &StopSignal) -> Result<RunSummary, PipelineError> {
        let summary = RunSummary::started(locale);
        let span = info_span!("ingest_run", run_id = %summary.run_id, locale = locale.code());
        let result = self.run_inner(locale, stop, summary).instrument(span).await;
        if let Err(err) = &result {
            self.sink.error(locale, &format!("Run aborted ({}): {err}", err.kind()));
        }
        result
    }

    /// Blocking wrapper for shells without an async runtime. Must not be called from inside one.
    pub fn run_blocking(&self, locale: Locale, stop: &StopSignal) -> Result<RunSummary, PipelineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| PipelineError::Configuration(format!("starting runtime: {err}")))?;
        runtime.block_on(self.run(locale, stop))
    }

    async fn run_inner(
        &self,
        locale: Locale,
        stop: &StopSignal,
        mut summary: RunSummary,
    ) -> Result<RunSummary, PipelineError> {
        let artifacts = ArtifactStore::new(self.config.artifacts_dir.clone());
        let catalog = CatalogFetcher::new(
            self.api.clone(),
            artifacts.clone(),
            self.sink.clone(),
            self.config.max_asins,
        );

        let outcome = if self.reuse_list {
            self.sink.info(locale, &format!("Starting run {}", summary.run_id));
            catalog.reuse(locale).await?
        } else {
            let node = self.registry.category_node(locale)?;
            self.sink.info(locale, &format!("Starting run {}", summary.run_id));
            match catalog.fetch(locale, node).await {
                Ok(outcome) => outcome,
                Err(err @ PipelineError::Configuration(_)) => return Err(err),
                Err(err) => {
                    self.sink.error(locale, &format!("Best-seller fetch failed: {err}"));
                    summary.record_error("bestsellers", &err);
                    return Ok(summary.finish());
                }
            }
        };

        let candidates = match outcome {
            CatalogOutcome::Candidates(candidates) => candidates,
            CatalogOutcome::Empty => return Ok(summary.finish()),
        };
        summary.candidates = candidates.len();

        let scheduler = BatchScheduler::new(
            SchedulerSettings {
                batch_size: self.config.batch_size,
                batch_delay: self.config.batch_delay,
                tokens_per_product: self.config.tokens_per_product,
            },
            self.api.clone(),
            self.store.clone(),
            DependentFetchStage::new(self.api.clone(), artifacts, self.sink.clone(), self.config.offers),
            EnrichmentWorker::new(
                self.api.clone(),
                self.store.clone(),
                self.sink.clone(),
                self.config.item_concurrency,
            ),
            self.sink.clone(),
        );
        scheduler.run(&candidates, stop, &mut summary).await?;

        let summary = summary.finish();
        self.sink.info(
            locale,
            &format!(
                "Run finished: {} processed, {} skipped, {} of {} batches abandoned",
                summary.items_processed, summary.items_skipped, summary.batches_abandoned, summary.batches_total
            ),
        );
        Ok(summary)
    }
}

/// Tracing plus the append-only log file; the file is skipped with a warning if it cannot be opened.
pub fn default_sink(config: &SyncConfig) -> Arc<dyn ProgressSink> {
    let tee = TeeSink::default().with(Arc::new(TracingSink));
    match FileSink::open(&config.log_file) {
        Ok(file) => Arc::new(tee.with(Arc::new(file))),
        Err(err) => {
            warn!(path = %config.log_file.display(), error = %err, "progress log file unavailable");
            Arc::new(tee)
        }
    }
}

/// Wires the HTTP client, the store and the registry from `config`. Fails before any external call
/// when credentials or the database location are missing.
pub async fn pipeline_from_config(
    config: SyncConfig,
    options: RunOptions,
    sink: Arc<dyn ProgressSink>,
) -> Result<IngestPipeline, PipelineError> {
    let keepa = config.keepa_config()?;
    let store: Arc<dyn ProductStore> = if options.dry_run {
        Arc::new(MemoryProductStore::new(config.retention_days))
    } else {
        Arc::new(config.pg_store()?)
    };
    let registry = LocaleRegistry::load(&config.locales_file).await?;
    let api = Arc::new(KeepaClient::with_default_budget(keepa)?);
    Ok(IngestPipeline::new(config, registry, api, store, sink).reuse_list(options.reuse_list))
}

pub async fn run_from_env(
    locale: Locale,
    options: RunOptions,
    stop: &StopSignal,
) -> Result<RunSummary, PipelineError> {
    let config = SyncConfig::from_env();
    let sink = default_sink(&config);
    let pipeline = pipeline_from_config(config, options, sink).await?;
    pipeline.run(locale, stop).await
}
