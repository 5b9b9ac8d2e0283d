use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shelfsync_core::{plan_token_usage, Locale, LocaleLoad, PlannerSettings, RunSummary};
use shelfsync_keepa::{CatalogApi, KeepaClient};
use shelfsync_storage::ProductStore;
use shelfsync_sync::{default_sink, pipeline_from_config, RunOptions, StopSignal, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelfsync")]
#[command(about = "Best-seller catalog ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest best sellers for each locale, one after another.
    Run {
        /// Defaults to every enabled locale in the registry.
        #[arg(long = "locale")]
        locales: Vec<Locale>,
        #[arg(long)]
        reuse_list: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Project token usage for locales run in parallel.
    Plan {
        #[arg(long)]
        tokens: f64,
        /// LOCALE:PRODUCTS:DELAY_SECS, e.g. IT:1000:30
        #[arg(long = "locale", value_parser = parse_load, required = true)]
        loads: Vec<LocaleLoad>,
        #[arg(long, default_value_t = 3600.0)]
        capacity: f64,
        #[arg(long, default_value_t = 60.0)]
        refill_per_minute: f64,
        #[arg(long, default_value_t = 11.4)]
        tokens_per_product: f64,
    },
    /// Ask the API for the current token balance.
    Tokens,
    /// Create the product table for a locale.
    EnsureSchema {
        #[arg(long)]
        locale: Locale,
    },
}

fn parse_load(raw: &str) -> Result<LocaleLoad, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [locale, products, delay] = parts.as_slice() else {
        return Err(format!("expected LOCALE:PRODUCTS:DELAY_SECS, got {raw:?}"));
    };
    Ok(LocaleLoad {
        locale: locale.parse().map_err(|e| format!("{e}"))?,
        products: products.parse().map_err(|e| format!("products: {e}"))?,
        delay_secs: delay.parse().map_err(|e| format!("delay: {e}"))?,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} locale={} candidates={} batches={}/{} abandoned={} processed={} skipped={} not_started={} stale_deleted={} cancelled={}",
        summary.run_id,
        summary.locale,
        summary.candidates,
        summary.batches_completed,
        summary.batches_total,
        summary.batches_abandoned,
        summary.items_processed,
        summary.items_skipped,
        summary.items_not_started,
        summary.stale_rows_deleted,
        summary.cancelled,
    );
    for error in &summary.errors {
        println!("  error: {error}");
    }
}

async fn run(locales: Vec<Locale>, options: RunOptions) -> Result<()> {
    let config = SyncConfig::from_env();
    let sink = default_sink(&config);
    let pipeline = pipeline_from_config(config.clone(), options, sink).await?;

    let locales = if locales.is_empty() {
        shelfsync_sync::LocaleRegistry::load(&config.locales_file).await?.enabled()
    } else {
        locales
    };
    if locales.is_empty() {
        bail!("no locale selected and none enabled in {}", config.locales_file.display());
    }

    let stop = StopSignal::new();
    let on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested; finishing the current batch");
            on_ctrl_c.request();
        }
    });

    let mut failed = Vec::new();
    for locale in locales {
        if stop.is_requested() {
            break;
        }
        match pipeline.run(locale, &stop).await {
            Ok(summary) => print_summary(&summary),
            Err(err) => {
                eprintln!("run for {locale} failed: {err}");
                failed.push(locale);
            }
        }
    }
    if !failed.is_empty() {
        bail!("{} locale run(s) failed", failed.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            locales,
            reuse_list,
            dry_run,
        } => run(locales, RunOptions { reuse_list, dry_run }).await?,
        Commands::Plan {
            tokens,
            loads,
            capacity,
            refill_per_minute,
            tokens_per_product,
        } => {
            let settings = PlannerSettings {
                capacity,
                refill_per_minute,
                tokens_per_product,
            };
            let Some(plan) = plan_token_usage(tokens, &loads, settings) else {
                bail!("nothing to plan: every locale needs products and a positive delay");
            };
            println!("processes/min: {:.2}", plan.processes_per_minute);
            println!("tokens used/min: {:.2}", plan.tokens_used_per_minute);
            println!("net change/min: {:.2}", plan.net_change_per_minute);
            println!("total minutes: {:.1}", plan.total_minutes);
            match plan.dips_below_zero_at {
                Some(minute) => println!("tokens run out at minute {minute}"),
                None => println!("sustainable: tokens never drop below zero"),
            }
        }
        Commands::Tokens => {
            let config = SyncConfig::from_env();
            let client = KeepaClient::with_default_budget(config.keepa_config()?)?;
            let snapshot = client
                .refresh_token_status()
                .await
                .context("refreshing token status")?;
            println!(
                "tokens: available={:.0} capacity={:.0} refill/min={:.1} observed_at={}",
                snapshot.available, snapshot.capacity, snapshot.refill_per_minute, snapshot.observed_at
            );
        }
        Commands::EnsureSchema { locale } => {
            let store = SyncConfig::from_env().pg_store()?;
            store.ensure_schema(locale).await?;
            info!(table = %locale.table_name(), "schema ensured");
            println!("ensured {}", locale.table_name());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_locale_loads() {
        let load = parse_load("IT:1000:30").unwrap();
        assert_eq!(load.locale, Locale::It);
        assert_eq!(load.products, 1000);
        assert_eq!(load.delay_secs, 30.0);
        assert!(parse_load("IT:1000").is_err());
        assert!(parse_load("XX:1:1").is_err());
    }

    #[test]
    fn cli_accepts_repeated_locales() {
        let cli = Cli::try_parse_from(["shelfsync", "run", "--locale", "IT", "--locale", "DE", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Run { locales, dry_run, .. } => {
                assert_eq!(locales, vec![Locale::It, Locale::De]);
                assert!(dry_run);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
