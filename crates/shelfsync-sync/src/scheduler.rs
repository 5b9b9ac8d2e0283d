//! Sequential batch driver: retention first, then paced batches until done or stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shelfsync_core::{Batch, CandidateList, Locale, PipelineError, RateBudget, RunSummary};
use shelfsync_keepa::CatalogApi;
use shelfsync_storage::ProductStore;
use tokio::sync::watch;
use tracing::info;

use crate::progress::ProgressSink;
use crate::stages::{DependentFetchStage, EnrichmentWorker};

/// Cooperative stop request shared between the shell and a running pipeline.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Sleeps for `duration` unless a stop arrives first. Returns false when stopped.
pub async fn sleep_or_stop(duration: Duration, stop: &StopSignal) -> bool {
    if duration.is_zero() {
        return !stop.is_requested();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.requested() => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub tokens_per_product: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batch_delay: Duration::from_secs(30),
            tokens_per_product: 11.4,
        }
    }
}

pub struct BatchScheduler {
    settings: SchedulerSettings,
    api: Arc<dyn CatalogApi>,
    store: Arc<dyn ProductStore>,
    fetch_stage: DependentFetchStage,
    worker: EnrichmentWorker,
    sink: Arc<dyn ProgressSink>,
}

impl BatchScheduler {
    pub fn new(
        settings: SchedulerSettings,
        api: Arc<dyn CatalogApi>,
        store: Arc<dyn ProductStore>,
        fetch_stage: DependentFetchStage,
        worker: EnrichmentWorker,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            settings,
            api,
            store,
            fetch_stage,
            worker,
            sink,
        }
    }

    /// Errors returned here are fatal to the run; batch and item failures are recorded in `summary`.
    pub async fn run(
        &self,
        candidates: &CandidateList,
        stop: &StopSignal,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let locale = candidates.locale;
        self.store.ensure_schema(locale).await?;
        let removed = self.store.delete_stale(locale).await?;
        summary.stale_rows_deleted = removed;
        self.sink.info(locale, &format!("Removed {removed} stale rows from {}", locale.table_name()));

        let batches = candidates.batches(self.settings.batch_size);
        summary.batches_total = batches.len();

        for (position, batch) in batches.iter().enumerate() {
            if position > 0 && !sleep_or_stop(self.settings.batch_delay, stop).await {
                summary.cancelled = true;
                break;
            }
            if stop.is_requested() || !self.await_budget(locale, batch, stop).await {
                summary.cancelled = true;
                break;
            }
            self.api.reserve_tokens(self.batch_cost(batch)).await;
            self.run_batch(locale, batch, summary).await;
        }

        if summary.cancelled {
            let started = summary.batches_completed + summary.batches_abandoned;
            let not_started = &batches[started.min(batches.len())..];
            let items: usize = not_started.iter().map(Batch::len).sum();
            summary.items_not_started = items;
            self.sink.info(
                locale,
                &format!("Stop requested; {} batches ({items} items) not started", not_started.len()),
            );
        }
        Ok(())
    }

    fn batch_cost(&self, batch: &Batch) -> f64 {
        self.settings.tokens_per_product * batch.len() as f64
    }

    /// Waits for the projected refill when the advisory budget cannot cover the batch.
    /// Returns false when stopped while waiting.
    async fn await_budget(&self, locale: Locale, batch: &Batch, stop: &StopSignal) -> bool {
        let cost = self.batch_cost(batch);
        let snapshot = self.api.token_budget().await;
        let now = Utc::now();
        let budget = RateBudget::new(snapshot.available, snapshot.capacity, snapshot.refill_per_minute, now);
        match budget.wait_for(cost, now) {
            Some(wait) if wait.is_zero() => true,
            Some(wait) => {
                self.sink.info(
                    locale,
                    &format!(
                        "Waiting {}s for {cost:.1} tokens ({:.1} available)",
                        wait.as_secs().max(1),
                        snapshot.available
                    ),
                );
                sleep_or_stop(wait, stop).await
            }
            None => {
                self.sink.warn(
                    locale,
                    &format!(
                        "Token budget cannot cover {cost:.1} tokens at {:.1}/min; continuing",
                        snapshot.refill_per_minute
                    ),
                );
                true
            }
        }
    }

    async fn run_batch(&self, locale: Locale, batch: &Batch, summary: &mut RunSummary) {
        let label = batch.label();
        self.sink.info(locale, &format!("Processing {label}"));

        let fetch = match self.fetch_stage.run(locale, batch).await {
            Ok(fetch) => fetch,
            Err(err) => {
                self.sink.error(locale, &format!("Abandoned {label}: {err}"));
                summary.record_error(&label, &err);
                summary.batches_abandoned += 1;
                summary.items_skipped += batch.len();
                return;
            }
        };

        for asin in &fetch.missing {
            self.sink.warn(locale, &format!("Skipped {asin}: not in detail response"));
        }
        for (asin, err) in &fetch.malformed {
            self.sink.error(locale, &format!("Skipped {asin}: {err}"));
            summary.record_error(asin, err);
        }
        summary.items_skipped += fetch.missing.len() + fetch.malformed.len();

        let tally = self.worker.process(locale, fetch.details, &fetch.snapshot).await;
        summary.items_processed += tally.stored;
        summary.items_skipped += tally.failed;
        summary.errors.extend(tally.errors);
        summary.batches_completed += 1;

        info!(batch = batch.index + 1, stored = tally.stored, failed = tally.failed, "batch complete");
        self.sink.info(locale, &format!("Completed {label}: {} stored", tally.stored));
    }
}
