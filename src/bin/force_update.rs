//! Run the pipeline for a single entity right now and print its outcome as JSON.
//!
//! `force_update --category shares --entity SBER --from 2024-01-01 --till 2024-03-01`

use anyhow::{anyhow, Context};
use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;
use market_ingest_lib::config::IngestConfig;
use market_ingest_lib::core::orchestrator::RunRequest;
use market_ingest_lib::core::scheduler::Pipelines;
use market_ingest_lib::models::{Category, EntityDescriptor};
use market_ingest_lib::{db, init_tracing};

#[derive(Parser)]
#[command(name = "force_update", about = "Ingest one entity immediately")]
struct Args {
    /// shares, bonds, currency or electricity.
    #[arg(long)]
    category: String,

    /// Ticker, bond id, currency pair or region code.
    #[arg(long)]
    entity: String,

    /// First day to fetch (YYYY-MM-DD). Defaults to the configured lookback.
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Exclusive end day (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    till: Option<NaiveDate>,

    /// Rows keyed before this day are pruned. Defaults to the configured retention.
    #[arg(long)]
    retain_from: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let category = Category::parse(&args.category)
        .ok_or_else(|| anyhow!("unknown category '{}'", args.category))?;
    let cfg = IngestConfig::from_env()?;

    let today = Utc::now().date_naive();
    let defaults = RunRequest::trailing(today, cfg.run.lookback_days, cfg.run.retention_days);
    let till = args.till.unwrap_or(defaults.till);
    let request = RunRequest {
        from: args.from.unwrap_or(till - Duration::days(i64::from(cfg.run.lookback_days))),
        till,
        retention_cutoff: args.retain_from.unwrap_or(defaults.retention_cutoff),
    };

    let pool = db::init(&cfg.database).await.context("opening database")?;
    let pipelines = Pipelines::from_config(&cfg, pool.clone())?;
    let entity = EntityDescriptor::new(args.entity, category);

    let report = pipelines.run(std::slice::from_ref(&entity), &request).await;
    db::record_outcomes(&pool, &report.outcomes).await;

    println!("{}", serde_json::to_string_pretty(&report.outcomes)?);
    pool.close().await;

    if report.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}
