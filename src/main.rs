use market_ingest_lib::config::IngestConfig;
use market_ingest_lib::core::scheduler;
use market_ingest_lib::{db, init_tracing};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = IngestConfig::from_env()?;
    info!(
        entities = cfg.entities.len(),
        schedule = %cfg.schedule,
        "starting market-ingest"
    );

    let pool = db::init(&cfg.database).await?;
    let mut sched = scheduler::init(cfg, pool.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Err(e) = sched.shutdown().await {
        error!(error = %e, "scheduler shutdown failed");
    }
    pool.close().await;
    Ok(())
}
