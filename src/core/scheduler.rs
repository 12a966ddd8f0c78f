use crate::config::IngestConfig;
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
use crate::db::{self, Store};
use crate::error::FetchError;
use crate::fetcher::electricity::ElectricityFetcher;
use crate::fetcher::moex::MoexFetcher;
use crate::models::{ActionRecord, BatchReport, ElectricityRecord, EntityDescriptor, RecordKind};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// One orchestrator per record variant, sharing a single provider-call limit.
#[derive(Clone)]
pub struct Pipelines {
    actions: Orchestrator<MoexFetcher, Store<ActionRecord>>,
    electricity: Orchestrator<ElectricityFetcher, Store<ElectricityRecord>>,
    settings: OrchestratorSettings,
}

impl Pipelines {
    pub fn from_config(cfg: &IngestConfig, pool: SqlitePool) -> Result<Self, FetchError> {
        Ok(Self::new(
            MoexFetcher::new(&cfg.provider)?,
            ElectricityFetcher::new(&cfg.provider)?,
            pool,
            OrchestratorSettings::from_config(cfg),
        ))
    }

    pub fn new(
        moex: MoexFetcher,
        electricity: ElectricityFetcher,
        pool: SqlitePool,
        settings: OrchestratorSettings,
    ) -> Self {
        let fetch_limit = Arc::new(Semaphore::new(settings.fetch_concurrency.max(1)));
        Self {
            actions: Orchestrator::new(moex, Store::new(pool.clone()), settings.clone())
                .with_fetch_limit(fetch_limit.clone()),
            electricity: Orchestrator::new(electricity, Store::new(pool), settings.clone())
                .with_fetch_limit(fetch_limit),
            settings,
        }
    }

    /// Run a mixed batch. Outcomes come back in the order of `entities`.
    pub async fn run(&self, entities: &[EntityDescriptor], request: &RunRequest) -> BatchReport {
        let deadline = Instant::now() + self.settings.batch_timeout;
        let (action_entities, electricity_entities): (Vec<_>, Vec<_>) = entities
            .iter()
            .cloned()
            .partition(|e| e.category.record_kind() == RecordKind::Action);

        let (actions, electricity) = tokio::join!(
            self.actions.run_batch_until(&action_entities, request, deadline),
            self.electricity.run_batch_until(&electricity_entities, request, deadline),
        );

        let mut actions = actions.outcomes.into_iter();
        let mut electricity = electricity.outcomes.into_iter();
        let outcomes = entities
            .iter()
            .filter_map(|e| match e.category.record_kind() {
                RecordKind::Action => actions.next(),
                RecordKind::Electricity => electricity.next(),
            })
            .collect();
        BatchReport { outcomes }
    }
}

/// One scheduled pass: trailing window up to today, then status bookkeeping.
pub async fn run_once(pipelines: &Pipelines, pool: &SqlitePool, cfg: &IngestConfig) -> BatchReport {
    let today = Utc::now().date_naive();
    let request = RunRequest::trailing(today, cfg.run.lookback_days, cfg.run.retention_days);
    info!(
        entities = cfg.entities.len(),
        from = %request.from,
        till = %request.till,
        "starting ingestion run"
    );

    let report = pipelines.run(&cfg.entities, &request).await;
    db::record_outcomes(pool, &report.outcomes).await;

    info!(
        updated = report.updated(),
        no_data = report.no_data(),
        failed = report.failed(),
        "ingestion run finished"
    );
    report
}

/// Register the cron job and kick off one run right away.
pub async fn init(cfg: IngestConfig, pool: SqlitePool) -> Result<JobScheduler, anyhow::Error> {
    let pipelines = Pipelines::from_config(&cfg, pool.clone())?;
    let cfg = Arc::new(cfg);
    let sched = JobScheduler::new().await?;

    let job_pipelines = pipelines.clone();
    let job_pool = pool.clone();
    let job_cfg = cfg.clone();
    sched
        .add(Job::new_async(cfg.schedule.as_str(), move |_uuid, _l| {
            let pipelines = job_pipelines.clone();
            let pool = job_pool.clone();
            let cfg = job_cfg.clone();
            Box::pin(async move {
                info!("running scheduled ingestion");
                run_once(&pipelines, &pool, &cfg).await;
            })
        })?)
        .await?;

    let startup_cfg = cfg.clone();
    tokio::spawn(async move {
        info!("running startup ingestion");
        let report = run_once(&pipelines, &pool, &startup_cfg).await;
        if report.failed() > 0 {
            error!(failed = report.failed(), "startup ingestion had failures");
        }
    });

    sched.start().await?;
    info!(schedule = %cfg.schedule, "scheduler started");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rate_limiter::RetryPolicy;
    use crate::db::tests::memory_pool;
    use crate::db::SeriesStore;
    use crate::fetcher::tests::{provider_config, serve};
    use crate::models::{Category, RunStatus};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            max_span_days: 100,
            entity_concurrency: 3,
            fetch_concurrency: 2,
            batch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::none(),
        }
    }

    #[tokio::test]
    async fn mixed_batch_keeps_input_order() {
        let router = Router::new()
            .route(
                "/stock/markets/shares/boards/TQBR/securities/:file",
                get(|| async {
                    r#"{"history": {"columns": ["TRADEDATE","CLOSE","OPEN","LOW","HIGH","TRENDCLSPR","VOLUME","VALUE","NUMTRADES"],
                        "data": [["2024-01-02", 270.1, 268.0, 267.5, 271.0, 0.5, 1000, 270100.0, 42]]}}"#
                }),
            )
            .route(
                "/electricity/prices/:file",
                get(|| async { r#"[{"time_start": "2024-01-02T10:00:00+00:00", "EUR_per_kWh": 0.12}]"# }),
            );
        let base = serve(router).await;
        let cfg = provider_config();
        let pool = memory_pool().await;
        let pipelines = Pipelines::new(
            MoexFetcher::with_base_url(&base, &cfg).unwrap(),
            ElectricityFetcher::with_base_url(&base, &cfg).unwrap(),
            pool.clone(),
            settings(),
        );

        let entities = vec![
            EntityDescriptor::new("SE3", Category::Electricity),
            EntityDescriptor::new("SBER", Category::Shares),
            EntityDescriptor::new("", Category::Currency),
        ];
        let request = RunRequest { from: date(2024, 1, 1), till: date(2024, 1, 10), retention_cutoff: date(2023, 1, 1) };
        let report = pipelines.run(&entities, &request).await;

        let order: Vec<_> = report.outcomes.iter().map(|o| o.entity.clone()).collect();
        assert_eq!(order, entities);
        assert_eq!(report.outcomes[0].status, RunStatus::Updated { records: 1 });
        assert_eq!(report.outcomes[1].status, RunStatus::Updated { records: 1 });
        assert!(matches!(report.outcomes[2].status, RunStatus::Failed { .. }));

        let shares: Store<ActionRecord> = Store::new(pool);
        let rows = shares.select_range("shares_sber", date(2024, 1, 1), date(2024, 1, 10)).await.unwrap();
        assert_eq!(rows[0].close, Some(270.1));
    }

    #[tokio::test]
    async fn init_schedules_and_runs_once_at_startup() {
        let router = Router::new().route(
            "/stock/markets/shares/boards/TQBR/securities/:file",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "") }),
        );
        let base = serve(router).await;
        let env: HashMap<&str, String> = [
            ("INGEST_PROVIDER_BASE", base),
            ("INGEST_SHARES", "SBER".to_string()),
            ("INGEST_BONDS", String::new()),
            ("INGEST_CURRENCIES", String::new()),
            ("INGEST_LOOKBACK_DAYS", "5".to_string()),
            ("INGEST_FETCH_RETRIES", "1".to_string()),
        ]
        .into_iter()
        .collect();
        let cfg = IngestConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
        let pool = memory_pool().await;

        let mut sched = init(cfg, pool.clone()).await.unwrap();

        let mut statuses = Vec::new();
        for _ in 0..100 {
            statuses = db::get_statuses(&pool).await.unwrap();
            if !statuses.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].entity, "SBER");
        assert_eq!(statuses[0].status, "no_data");

        sched.shutdown().await.unwrap();
    }
}
