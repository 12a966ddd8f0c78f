use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider endpoint family. Selects both the URL path segment and the
/// record variant produced for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Shares,
    Bonds,
    Currency,
    Electricity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Action,
    Electricity,
}

impl Category {
    pub fn path(&self) -> &'static str {
        match self {
            Category::Shares => "stock/markets/shares/boards/TQBR/securities",
            Category::Bonds => "bonds/markets/shares/boards/TQBR/securities",
            Category::Currency => "currency/markets/selt/boards/CETS/securities",
            Category::Electricity => "electricity/prices",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Shares => "shares",
            Category::Bonds => "bonds",
            Category::Currency => "currency",
            Category::Electricity => "electricity",
        }
    }

    pub fn record_kind(&self) -> RecordKind {
        match self {
            Category::Electricity => RecordKind::Electricity,
            _ => RecordKind::Action,
        }
    }

    pub fn parse(value: &str) -> Option<Category> {
        match value.trim().to_lowercase().as_str() {
            "shares" | "stock" | "action" | "actions" => Some(Category::Shares),
            "bonds" | "bond" => Some(Category::Bonds),
            "currency" | "currencies" => Some(Category::Currency),
            "electricity" => Some(Category::Electricity),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independently ingested series: a ticker, bond, currency pair or region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub id: String,
    pub category: Category,
}

impl EntityDescriptor {
    pub fn new(id: impl Into<String>, category: Category) -> Self {
        Self { id: id.into(), category }
    }

    /// Table holding this entity's series, e.g. `shares_sber` or `currency_usd_rub`.
    pub fn table_name(&self) -> String {
        let id: String = self
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{}_{}", self.category.as_str(), id)
    }
}

impl fmt::Display for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.id)
    }
}

/// Opaque document returned by one provider call. `Value::Null` stands for
/// "nothing usable".
pub type RawPayload = serde_json::Value;

/// Half-open date range `[from_date, till_date)` sized to the provider's page limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub entity_id: String,
    pub category: Category,
    pub from_date: NaiveDate,
    pub till_date: NaiveDate,
}

impl FetchWindow {
    pub fn span_days(&self) -> i64 {
        (self.till_date - self.from_date).num_days()
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {})", self.entity_id, self.from_date, self.till_date)
    }
}

/// Daily trading history row. Metric fields tolerate nulls from the provider;
/// the store refuses to persist a record until all of them are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub date: NaiveDate,
    pub close: Option<f64>,
    pub open: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub trend_close_spread: Option<f64>,
    pub volume: Option<i64>,
    pub value: Option<f64>,
    pub num_trades: Option<i64>,
}

impl ActionRecord {
    pub fn is_complete(&self) -> bool {
        self.close.is_some()
            && self.open.is_some()
            && self.low.is_some()
            && self.high.is_some()
            && self.trend_close_spread.is_some()
            && self.volume.is_some()
            && self.value.is_some()
            && self.num_trades.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectricityRecord {
    pub timestamp: NaiveDateTime,
    pub price: f64,
}

/// What the orchestrator needs to know about any record variant.
pub trait SeriesRecord: Clone + Send + Sync + 'static {
    fn timestamp(&self) -> NaiveDateTime;

    /// Whether every column the store requires is present.
    fn is_complete(&self) -> bool {
        true
    }
}

impl SeriesRecord for ActionRecord {
    fn timestamp(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN)
    }

    fn is_complete(&self) -> bool {
        ActionRecord::is_complete(self)
    }
}

impl SeriesRecord for ElectricityRecord {
    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// Per-entity result of one pipeline run, as reported to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Updated { records: usize },
    NoData,
    #[serde(rename = "error")]
    Failed { message: String },
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Updated { .. } => "updated",
            RunStatus::NoData => "no_data",
            RunStatus::Failed { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity: EntityDescriptor,
    #[serde(flatten)]
    pub status: RunStatus,
}

/// Every entity's outcome for one batch run, in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<EntityOutcome>,
}

impl BatchReport {
    pub fn updated(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Updated { .. }))
    }

    pub fn no_data(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::NoData))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&RunStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_sanitizes_entity_id() {
        let usd = EntityDescriptor::new("USD_RUB", Category::Currency);
        assert_eq!(usd.table_name(), "currency_usd_rub");

        let odd = EntityDescriptor::new("SU26238.RMFS", Category::Bonds);
        assert_eq!(odd.table_name(), "bonds_su26238_rmfs");
    }

    #[test]
    fn run_status_serializes_with_scheduler_labels() {
        let updated = serde_json::to_value(RunStatus::Updated { records: 3 }).unwrap();
        assert_eq!(updated["status"], "updated");
        assert_eq!(updated["records"], 3);

        let failed = serde_json::to_value(RunStatus::Failed { message: "boom".into() }).unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["message"], "boom");

        let none = serde_json::to_value(RunStatus::NoData).unwrap();
        assert_eq!(none["status"], "no_data");
    }

    #[test]
    fn category_parse_accepts_aliases() {
        assert_eq!(Category::parse("Stock"), Some(Category::Shares));
        assert_eq!(Category::parse("bond"), Some(Category::Bonds));
        assert_eq!(Category::parse("weather"), None);
    }
}
