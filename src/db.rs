use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::models::{ActionRecord, ElectricityRecord, EntityOutcome, RunStatus};
use crate::parser::{parse_date, parse_datetime};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::{debug, error, info};

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Open the connection pool and run migrations for the fixed tables.
/// Per-entity series tables are created on demand by `SeriesStore::ensure_table`.
pub async fn init(cfg: &DatabaseConfig) -> StoreResult<SqlitePool> {
    info!(url = %cfg.url, max_connections = cfg.max_connections, "connecting to database");

    // Writers queue on the busy handler instead of failing while another
    // entity's transaction holds the write lock.
    let mut options = SqliteConnectOptions::from_str(&cfg.url)?.busy_timeout(cfg.acquire_timeout);
    if !cfg.url.contains(":memory:") {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.acquire_timeout)
        .connect_with(options)
        .await?;

    info!("running migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("database initialized");
    Ok(pool)
}

/// Per-variant table layout. The key column is the natural key; every other
/// column is overwritten on conflict.
pub trait TableSchema: Clone + Send + Sync + Sized + 'static {
    const KEY_COLUMN: &'static str;
    const VALUE_COLUMNS: &'static [&'static str];
    /// Column definitions for `CREATE TABLE`, key first.
    const COLUMN_DDL: &'static str;

    /// Stored key for the first instant of `day`. Keys sort lexically in time order.
    fn day_key(day: NaiveDate) -> String;

    fn key(&self) -> String;

    /// Bind the key followed by every value column, in declaration order.
    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;

    fn decode(row: &SqliteRow) -> Result<Self, String>;
}

impl TableSchema for ActionRecord {
    const KEY_COLUMN: &'static str = "date";
    const VALUE_COLUMNS: &'static [&'static str] = &[
        "close",
        "open",
        "low",
        "high",
        "trendclspr",
        "volume",
        "value",
        "numtrades",
    ];
    const COLUMN_DDL: &'static str = "date TEXT PRIMARY KEY NOT NULL,
            close REAL NOT NULL,
            open REAL NOT NULL,
            low REAL NOT NULL,
            high REAL NOT NULL,
            trendclspr REAL NOT NULL,
            volume INTEGER NOT NULL,
            value REAL NOT NULL,
            numtrades INTEGER NOT NULL";

    fn day_key(day: NaiveDate) -> String {
        day.format("%Y-%m-%d").to_string()
    }

    fn key(&self) -> String {
        Self::day_key(self.date)
    }

    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.key())
            .bind(self.close)
            .bind(self.open)
            .bind(self.low)
            .bind(self.high)
            .bind(self.trend_close_spread)
            .bind(self.volume)
            .bind(self.value)
            .bind(self.num_trades)
    }

    fn decode(row: &SqliteRow) -> Result<Self, String> {
        let raw: String = row.try_get("date").map_err(|e| e.to_string())?;
        let date = parse_date(&raw).ok_or_else(|| format!("bad date '{}'", raw))?;
        let f = |col: &str| row.try_get::<Option<f64>, _>(col).map_err(|e| e.to_string());
        let i = |col: &str| row.try_get::<Option<i64>, _>(col).map_err(|e| e.to_string());
        Ok(ActionRecord {
            date,
            close: f("close")?,
            open: f("open")?,
            low: f("low")?,
            high: f("high")?,
            trend_close_spread: f("trendclspr")?,
            volume: i("volume")?,
            value: f("value")?,
            num_trades: i("numtrades")?,
        })
    }
}

impl TableSchema for ElectricityRecord {
    const KEY_COLUMN: &'static str = "timestamp";
    const VALUE_COLUMNS: &'static [&'static str] = &["price"];
    const COLUMN_DDL: &'static str = "timestamp TEXT PRIMARY KEY NOT NULL,
            price REAL NOT NULL";

    fn day_key(day: NaiveDate) -> String {
        format!("{} 00:00:00", day.format("%Y-%m-%d"))
    }

    /// Sub-second precision is kept only when present, so whole-second keys stay
    /// in the `day_key` format and still sort lexically.
    fn key(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }

    fn bind_values<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.key()).bind(self.price)
    }

    fn decode(row: &SqliteRow) -> Result<Self, String> {
        let raw: String = row.try_get("timestamp").map_err(|e| e.to_string())?;
        let timestamp = parse_datetime(&raw).ok_or_else(|| format!("bad timestamp '{}'", raw))?;
        let price: f64 = row.try_get("price").map_err(|e| e.to_string())?;
        Ok(ElectricityRecord { timestamp, price })
    }
}

/// Validate a table name and return it quoted for interpolation into DDL/DML.
/// Values always travel as bound parameters; only identifiers are interpolated.
pub fn quoted_table(name: &str) -> StoreResult<String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > 63 {
        return Err(StoreError::InvalidTableName(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub pruned: u64,
    pub upserted: u64,
}

/// Storage capability set consumed by the orchestrator.
#[async_trait]
pub trait SeriesStore: Send + Sync {
    type Record: Send + Sync;

    async fn ensure_table(&self, table: &str) -> StoreResult<()>;

    /// Delete rows keyed strictly before the start of `older_than`.
    async fn prune(&self, table: &str, older_than: NaiveDate) -> StoreResult<u64>;

    /// Insert-or-overwrite keyed by timestamp. Later duplicates in `records` win.
    async fn upsert(&self, table: &str, records: &[Self::Record]) -> StoreResult<u64>;

    /// Inclusive whole-day range read, ascending by key.
    async fn select_range(
        &self,
        table: &str,
        from: NaiveDate,
        till: NaiveDate,
    ) -> StoreResult<Vec<Self::Record>>;

    /// `ensure_table`, `prune` and `upsert` inside one transaction. Either all of it
    /// becomes visible or none of it does.
    async fn update(
        &self,
        table: &str,
        retention_cutoff: NaiveDate,
        records: &[Self::Record],
    ) -> StoreResult<UpdateSummary>;
}

/// Pool-backed store for one record variant. Cloning shares the pool.
pub struct Store<R> {
    pool: SqlitePool,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), _record: PhantomData }
    }
}

impl<R: TableSchema> Store<R> {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, _record: PhantomData }
    }
}

async fn ensure_table_on<R: TableSchema>(conn: &mut SqliteConnection, table: &str) -> StoreResult<()> {
    let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quoted_table(table)?, R::COLUMN_DDL);
    sqlx::query(&sql).execute(&mut *conn).await?;
    debug!(table, "table created or already exists");
    Ok(())
}

async fn prune_on<R: TableSchema>(
    conn: &mut SqliteConnection,
    table: &str,
    older_than: NaiveDate,
) -> StoreResult<u64> {
    let sql = format!("DELETE FROM {} WHERE {} < ?", quoted_table(table)?, R::KEY_COLUMN);
    let result = sqlx::query(&sql)
        .bind(R::day_key(older_than))
        .execute(&mut *conn)
        .await?;
    debug!(table, cutoff = %older_than, deleted = result.rows_affected(), "pruned old rows");
    Ok(result.rows_affected())
}

fn upsert_sql<R: TableSchema>(quoted: &str) -> String {
    let columns: Vec<&str> = std::iter::once(R::KEY_COLUMN)
        .chain(R::VALUE_COLUMNS.iter().copied())
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates = R::VALUE_COLUMNS
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        quoted,
        columns.join(", "),
        placeholders,
        R::KEY_COLUMN,
        updates
    )
}

async fn upsert_on<R: TableSchema>(
    conn: &mut SqliteConnection,
    table: &str,
    records: &[R],
) -> StoreResult<u64> {
    let sql = upsert_sql::<R>(&quoted_table(table)?);
    let mut written = 0;
    for record in records {
        let result = record.bind_values(sqlx::query(&sql)).execute(&mut *conn).await?;
        written += result.rows_affected();
    }
    debug!(table, written, "upserted records");
    Ok(written)
}

#[async_trait]
impl<R: TableSchema> SeriesStore for Store<R> {
    type Record = R;

    async fn ensure_table(&self, table: &str) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        ensure_table_on::<R>(&mut conn, table).await
    }

    async fn prune(&self, table: &str, older_than: NaiveDate) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        prune_on::<R>(&mut conn, table, older_than).await
    }

    async fn upsert(&self, table: &str, records: &[R]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let written = upsert_on::<R>(&mut tx, table, records).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn select_range(&self, table: &str, from: NaiveDate, till: NaiveDate) -> StoreResult<Vec<R>> {
        let Some(after_till) = till.succ_opt() else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT * FROM {} WHERE {key} >= ? AND {key} < ? ORDER BY {key} ASC",
            quoted_table(table)?,
            key = R::KEY_COLUMN
        );
        let rows = sqlx::query(&sql)
            .bind(R::day_key(from))
            .bind(R::day_key(after_till))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                R::decode(row).map_err(|reason| StoreError::CorruptRow {
                    table: table.to_string(),
                    reason,
                })
            })
            .collect()
    }

    async fn update(
        &self,
        table: &str,
        retention_cutoff: NaiveDate,
        records: &[R],
    ) -> StoreResult<UpdateSummary> {
        // BEGIN IMMEDIATE takes the write lock up front. A deferred transaction
        // would start with a shared lock and fail with SQLITE_BUSY when two
        // entities both try to upgrade it. Nothing below is visible to other
        // connections until commit.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        debug!(table, "transaction open");

        let result = async {
            ensure_table_on::<R>(&mut conn, table).await?;
            let pruned = prune_on::<R>(&mut conn, table, retention_cutoff).await?;
            let upserted = upsert_on::<R>(&mut conn, table, records).await?;
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok::<_, StoreError>(UpdateSummary { pruned, upserted })
        }
        .await;

        match result {
            Ok(summary) => {
                info!(table, pruned = summary.pruned, upserted = summary.upserted, "transaction committed");
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!(table, error = %rollback_err, "rollback failed");
                }
                error!(table, error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }
}

/// Last recorded outcome for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub entity: String,
    pub category: String,
    pub status: String,
    pub message: Option<String>,
    pub record_count: i64,
    pub finished_at: String,
}

pub async fn record_status(pool: &SqlitePool, outcome: &EntityOutcome) -> StoreResult<()> {
    let (message, count) = match &outcome.status {
        RunStatus::Updated { records } => (None, *records as i64),
        RunStatus::NoData => (None, 0),
        RunStatus::Failed { message } => (Some(message.as_str()), 0),
    };

    sqlx::query(
        "INSERT INTO ingestion_status (entity, category, status, message, record_count, finished_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (entity, category) DO UPDATE
         SET status = EXCLUDED.status,
             message = EXCLUDED.message,
             record_count = EXCLUDED.record_count,
             finished_at = EXCLUDED.finished_at",
    )
    .bind(&outcome.entity.id)
    .bind(outcome.entity.category.as_str())
    .bind(outcome.status.label())
    .bind(message)
    .bind(count)
    .bind(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record every outcome; a bookkeeping failure is logged and never changes the outcomes.
pub async fn record_outcomes(pool: &SqlitePool, outcomes: &[EntityOutcome]) {
    for outcome in outcomes {
        if let Err(e) = record_status(pool, outcome).await {
            error!(entity = %outcome.entity, error = %e, "failed to record run status");
        }
    }
}

pub async fn get_statuses(pool: &SqlitePool) -> StoreResult<Vec<StatusRow>> {
    let rows = sqlx::query(
        "SELECT entity, category, status, message, record_count, finished_at
         FROM ingestion_status
         ORDER BY category, entity",
    )
    .fetch_all(pool)
    .await?;

    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(StatusRow {
            entity: row.try_get("entity")?,
            category: row.try_get("category")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
            record_count: row.try_get("record_count")?,
            finished_at: row.try_get("finished_at")?,
        });
    }
    Ok(result)
}
