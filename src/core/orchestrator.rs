use crate::config::IngestConfig;
use crate::core::rate_limiter::RetryPolicy;
use crate::core::windows::plan_windows;
use crate::db::SeriesStore;
use crate::error::{FetchError, StoreError, ValidationError};
use crate::fetcher::{SeriesSource, WindowFetch};
use crate::models::{BatchReport, EntityDescriptor, EntityOutcome, FetchWindow, RunStatus, SeriesRecord};
use chrono::{Duration as ChronoDuration, NaiveDate};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Range to ingest plus the oldest day the table may keep afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub from: NaiveDate,
    pub till: NaiveDate,
    pub retention_cutoff: NaiveDate,
}

impl RunRequest {
    /// `[today - lookback, today)`, keeping `retention_days` of history.
    pub fn trailing(today: NaiveDate, lookback_days: u32, retention_days: u32) -> Self {
        let back = |days: u32| {
            today
                .checked_sub_signed(ChronoDuration::days(i64::from(days)))
                .unwrap_or(NaiveDate::MIN)
        };
        Self {
            from: back(lookback_days),
            till: today,
            retention_cutoff: back(retention_days),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_span_days: u32,
    pub entity_concurrency: usize,
    pub fetch_concurrency: usize,
    pub batch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &IngestConfig) -> Self {
        Self {
            max_span_days: cfg.provider.max_span_days,
            entity_concurrency: cfg.run.entity_concurrency,
            fetch_concurrency: cfg.run.fetch_concurrency,
            batch_timeout: cfg.run.batch_timeout,
            retry: RetryPolicy::from(&cfg.run.retry),
        }
    }
}

/// Runs WindowPlanner -> Fetcher -> RecordParser -> Store for entities of one
/// record variant. Cloning shares the source, store and fetch limit.
pub struct Orchestrator<S, D> {
    source: Arc<S>,
    store: Arc<D>,
    settings: OrchestratorSettings,
    fetch_limit: Arc<Semaphore>,
}

impl<S, D> Clone for Orchestrator<S, D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            fetch_limit: self.fetch_limit.clone(),
        }
    }
}

enum FetchPhase<R> {
    Records(Vec<R>),
    NoData,
    Failed(String),
}

pub fn validate(entity: &EntityDescriptor, request: &RunRequest) -> Result<(), ValidationError> {
    if entity.id.trim().is_empty() {
        return Err(ValidationError::EmptyEntityId);
    }
    if !entity
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::InvalidEntityId(entity.id.clone()));
    }
    if request.from > request.till {
        return Err(ValidationError::InvertedRange {
            from: request.from.to_string(),
            till: request.till.to_string(),
        });
    }
    Ok(())
}

impl<S, D> Orchestrator<S, D>
where
    S: SeriesSource + 'static,
    D: SeriesStore<Record = S::Record> + 'static,
{
    pub fn new(source: S, store: D, settings: OrchestratorSettings) -> Self {
        let fetch_limit = Arc::new(Semaphore::new(settings.fetch_concurrency.max(1)));
        Self {
            source: Arc::new(source),
            store: Arc::new(store),
            settings,
            fetch_limit,
        }
    }

    /// Share one provider-call limit between orchestrators hitting the same provider.
    pub fn with_fetch_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.fetch_limit = limit;
        self
    }

    /// Run every entity with per-entity isolation. Never fails as a whole: each
    /// entity's outcome is reported in request order.
    pub async fn run_batch(&self, entities: &[EntityDescriptor], request: &RunRequest) -> BatchReport {
        let deadline = Instant::now() + self.settings.batch_timeout;
        self.run_batch_until(entities, request, deadline).await
    }

    pub async fn run_batch_until(
        &self,
        entities: &[EntityDescriptor],
        request: &RunRequest,
        deadline: Instant,
    ) -> BatchReport {
        info!(source = self.source.name(), entities = entities.len(), "batch run started");
        let workers = Arc::new(Semaphore::new(self.settings.entity_concurrency.max(1)));

        let handles: Vec<_> = entities
            .iter()
            .cloned()
            .map(|entity| {
                let this = self.clone();
                let request = request.clone();
                let workers = workers.clone();
                tokio::spawn(async move {
                    let _permit = workers.acquire_owned().await;
                    this.run_entity_until(&entity, &request, deadline).await
                })
            })
            .collect();

        let mut report = BatchReport::default();
        for (entity, handle) in entities.iter().zip(handles) {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => {
                    error!(entity = %entity, error = %e, "entity task aborted");
                    RunStatus::Failed { message: format!("entity task aborted: {}", e) }
                }
            };
            report.outcomes.push(EntityOutcome { entity: entity.clone(), status });
        }

        info!(
            source = self.source.name(),
            updated = report.updated(),
            no_data = report.no_data(),
            failed = report.failed(),
            "batch run finished"
        );
        report
    }

    pub async fn run_entity(&self, entity: &EntityDescriptor, request: &RunRequest) -> RunStatus {
        let deadline = Instant::now() + self.settings.batch_timeout;
        self.run_entity_until(entity, request, deadline).await
    }

    /// One entity's pipeline. The deadline bounds the fetch phase only; once the
    /// store transaction starts it always reaches commit or rollback.
    pub async fn run_entity_until(
        &self,
        entity: &EntityDescriptor,
        request: &RunRequest,
        deadline: Instant,
    ) -> RunStatus {
        let status = self.pipeline(entity, request, deadline).await;
        match &status {
            RunStatus::Updated { records } => info!(entity = %entity, records, "entity updated"),
            RunStatus::NoData => info!(entity = %entity, "no data for entity"),
            RunStatus::Failed { message } => warn!(entity = %entity, error = %message, "entity failed"),
        }
        status
    }

    async fn pipeline(&self, entity: &EntityDescriptor, request: &RunRequest, deadline: Instant) -> RunStatus {
        if let Err(e) = validate(entity, request) {
            return RunStatus::Failed { message: e.to_string() };
        }
        if self.settings.max_span_days == 0 {
            return RunStatus::Failed { message: ValidationError::ZeroSpan.to_string() };
        }

        let windows = plan_windows(
            &entity.id,
            entity.category,
            request.from,
            request.till,
            self.settings.max_span_days,
        );
        if windows.is_empty() {
            return RunStatus::NoData;
        }
        debug!(entity = %entity, windows = windows.len(), "planned fetch windows");

        let phase = match tokio::time::timeout_at(deadline, self.fetch_records(entity, &windows)).await {
            Ok(phase) => phase,
            Err(_) => {
                return RunStatus::Failed {
                    message: "batch deadline exceeded while fetching".to_string(),
                }
            }
        };

        let records = match phase {
            FetchPhase::Records(records) => records,
            FetchPhase::NoData => return RunStatus::NoData,
            FetchPhase::Failed(message) => return RunStatus::Failed { message },
        };

        let count = records.len();
        let store = self.store.clone();
        let table = entity.table_name();
        let cutoff = request.retention_cutoff;
        // Detached so that cancelling the caller cannot strand an open transaction.
        let handle = tokio::spawn(async move { store.update(&table, cutoff, &records).await });

        match handle.await {
            Ok(Ok(_)) => RunStatus::Updated { records: count },
            Ok(Err(e)) => RunStatus::Failed { message: e.to_string() },
            Err(e) => RunStatus::Failed { message: StoreError::Aborted(e.to_string()).to_string() },
        }
    }

    async fn fetch_window_with_retry(&self, window: &FetchWindow) -> Result<WindowFetch, FetchError> {
        self.settings
            .retry
            .run(move |attempt| async move {
                let _permit = self.fetch_limit.acquire().await;
                if attempt > 0 {
                    debug!(window = %window, attempt, "retrying window");
                }
                self.source.fetch_window(window).await
            })
            .await
    }

    async fn fetch_records(&self, entity: &EntityDescriptor, windows: &[FetchWindow]) -> FetchPhase<S::Record> {
        let results = join_all(windows.iter().map(|w| self.fetch_window_with_retry(w))).await;

        let mut transport_failures = 0;
        let mut last_error = None;
        let mut records = Vec::new();
        for (window, result) in windows.iter().zip(results) {
            match result {
                Ok(WindowFetch::Payload(payload)) => {
                    let parsed = self.source.parse_payload(&payload);
                    debug!(window = %window, records = parsed.len(), "parsed window");
                    records.extend(parsed);
                }
                Ok(WindowFetch::NoData { .. }) => {}
                Err(e) => {
                    warn!(window = %window, error = %e, "skipping window after transport failures");
                    transport_failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if transport_failures == windows.len() {
            let message = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "all windows failed".to_string());
            return FetchPhase::Failed(message);
        }

        records.sort_by_key(|r| r.timestamp());
        let before = records.len();
        records.retain(|r| r.is_complete());
        if records.len() < before {
            debug!(entity = %entity, dropped = before - records.len(), "dropped incomplete records");
        }

        if records.is_empty() {
            FetchPhase::NoData
        } else {
            FetchPhase::Records(records)
        }
    }
}
