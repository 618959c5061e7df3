//! whalewatch - institutional options flow scanner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whalewatch_backend::{
    aggregation::AggregationEngine,
    backfill::BackfillOrchestrator,
    models::Config,
    oracle::{HistoricalPriceOracle, LivePriceOracle, PriceOracle},
    pipeline::TradePipeline,
    storage::TradeStore,
    stream::StreamIngestor,
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Parser)]
#[command(name = "whalewatch", about = "Institutional options flow scanner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live feed ingestor (default).
    Stream,
    /// Replay one underlying for one trading day.
    Backfill {
        #[arg(long)]
        ticker: String,
        /// Target date, YYYY-MM-DD.
        #[arg(long)]
        date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,whalewatch_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    info!(watchlist = ?config.watchlist, min_premium = config.min_premium, "starting");

    let store = TradeStore::new(&config.database_path)?;
    let engine = Arc::new(AggregationEngine::new());

    match cli.command.unwrap_or(Command::Stream) {
        Command::Stream => run_stream(config, store, engine).await,
        Command::Backfill { ticker, date } => run_backfill(config, store, engine, ticker, date).await,
    }
}

async fn run_stream(config: Config, store: TradeStore, engine: Arc<AggregationEngine>) -> Result<()> {
    let oracle: Arc<dyn PriceOracle> = Arc::new(LivePriceOracle::new(
        config.rest_base_url.clone(),
        config.api_key.clone(),
        config.price_cache_ttl_ms,
    ));
    let pipeline = Arc::new(TradePipeline::new(
        &config,
        oracle,
        store.clone(),
        engine.clone(),
    ));

    let retention_hours = config.retention_hours;
    let sweep_engine = engine.clone();
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let cutoff_ms = (Utc::now() - chrono::Duration::hours(retention_hours))
                .timestamp_millis();
            let buckets = sweep_engine.sweep_retention(cutoff_ms);
            match sweep_store.sweep_retention(cutoff_ms) {
                Ok(rows) => info!(buckets, rows, "retention sweep"),
                Err(e) => warn!(error = %e, "trade retention sweep failed"),
            }
        }
    });

    let ingestor = StreamIngestor::new(
        config.ws_url.clone(),
        config.api_key.clone(),
        config.watchlist.clone(),
        pipeline,
    );
    ingestor.run().await;
    Ok(())
}

async fn run_backfill(
    config: Config,
    store: TradeStore,
    engine: Arc<AggregationEngine>,
    ticker: String,
    date: NaiveDate,
) -> Result<()> {
    let oracle: Arc<dyn PriceOracle> = Arc::new(HistoricalPriceOracle::new(
        config.rest_base_url.clone(),
        config.api_key.clone(),
    ));
    let pipeline = Arc::new(TradePipeline::new(
        &config,
        oracle,
        store,
        engine,
    ));

    let orchestrator = BackfillOrchestrator::new(
        config.rest_base_url.clone(),
        config.api_key.clone(),
        config.backfill_call_delay_ms,
        config.backfill_page_cap,
        pipeline,
    );

    let report = orchestrator.run(&ticker, date).await?;
    info!(
        contracts = report.contracts_discovered,
        processed = report.contracts_processed,
        failed = report.contracts_failed,
        capped = report.contracts_capped,
        fetched = report.trades_fetched,
        accepted = report.trades_accepted,
        duplicates = report.trades_duplicate,
        "backfill complete"
    );
    Ok(())
}
