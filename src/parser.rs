//! Column-indexed payload parsing.
//!
//! Provider payloads look like `{"history": {"columns": [...], "data": [[...], ...]}}`.
//! Column positions drift between provider versions, so every required column is
//! resolved by name before any row is read.

use crate::error::RowError;
use crate::models::{ActionRecord, ElectricityRecord, RawPayload};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use tracing::{debug, info};

static NULL: Value = Value::Null;

/// A record that can be built from one row of a column-indexed table.
pub trait TabularRecord: Sized {
    /// Required columns in the order `from_cells` expects them. Each entry lists
    /// accepted header names, matched case-insensitively.
    const COLUMNS: &'static [&'static [&'static str]];

    fn from_cells(cells: &[&Value]) -> Result<Self, RowError>;
}

/// Positions of the required columns inside one payload's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIndex {
    positions: Vec<usize>,
}

impl ColumnIndex {
    /// Resolve `wanted` against a header. `None` if any required column is absent.
    pub fn resolve(header: &[Value], wanted: &[&[&str]]) -> Option<Self> {
        let names: Vec<Option<String>> = header
            .iter()
            .map(|h| h.as_str().map(|s| s.trim().to_ascii_uppercase()))
            .collect();

        let positions = wanted
            .iter()
            .map(|aliases| {
                aliases.iter().find_map(|alias| {
                    names
                        .iter()
                        .position(|n| n.as_deref() == Some(alias.to_ascii_uppercase().as_str()))
                })
            })
            .collect::<Option<Vec<usize>>>()?;

        Some(Self { positions })
    }

    fn cells<'a, R: TabularRecord>(&self, row: &'a Value) -> Result<Vec<&'a Value>, RowError> {
        let row = row.as_array().ok_or(RowError::NotArray)?;
        self.positions
            .iter()
            .zip(R::COLUMNS)
            .map(|(&pos, aliases)| row.get(pos).ok_or(RowError::MissingCell(aliases[0])))
            .collect()
    }
}

/// Parse every row of a `history` table into `R`, preserving provider order.
///
/// A payload without a recognizable header yields an empty vector. Rows that fail
/// to convert are dropped and logged individually.
pub fn parse_table<R: TabularRecord>(payload: &RawPayload) -> Vec<R> {
    let table = &payload["history"];
    let Some(header) = table["columns"].as_array() else {
        debug!("payload has no column header");
        return Vec::new();
    };
    let Some(index) = ColumnIndex::resolve(header, R::COLUMNS) else {
        info!(columns = ?header, "payload header is missing required columns");
        return Vec::new();
    };
    let Some(rows) = table["data"].as_array() else {
        return Vec::new();
    };

    let mut records = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        match index.cells::<R>(row).and_then(|cells| R::from_cells(&cells)) {
            Ok(record) => records.push(record),
            Err(e) => debug!(row = i, reason = %e, "dropping malformed row"),
        }
    }
    records
}

fn type_name(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn opt_f64(v: &Value, column: &'static str) -> Result<Option<f64>, RowError> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| RowError::WrongType {
            column,
            expected: "number",
            found: format!("'{}'", s),
        }),
        other => Err(RowError::WrongType { column, expected: "number", found: type_name(other) }),
    }
}

fn opt_i64(v: &Value, column: &'static str) -> Result<Option<i64>, RowError> {
    if let Some(i) = v.as_i64() {
        return Ok(Some(i));
    }
    match opt_f64(v, column)? {
        None => Ok(None),
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Some(f as i64)),
        Some(f) => Err(RowError::WrongType { column, expected: "integer", found: f.to_string() }),
    }
}

fn req_f64(v: &Value, column: &'static str) -> Result<f64, RowError> {
    opt_f64(v, column)?.ok_or(RowError::WrongType {
        column,
        expected: "number",
        found: "null".to_string(),
    })
}

fn as_text<'a>(v: &'a Value, column: &'static str) -> Result<&'a str, RowError> {
    v.as_str().ok_or_else(|| RowError::WrongType {
        column,
        expected: "string",
        found: type_name(v),
    })
}

/// A bare date, or the date part of a `T`/space separated datetime.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let day = raw.split(['T', ' ']).next().unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Accepts RFC 3339 (offset dropped after converting to UTC), naive datetimes
/// with `T` or space separators, and bare dates (midnight).
pub(crate) fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    if raw.len() == 10 {
        return NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    None
}

impl TabularRecord for ActionRecord {
    const COLUMNS: &'static [&'static [&'static str]] = &[
        &["TRADEDATE"],
        &["CLOSE"],
        &["OPEN"],
        &["LOW"],
        &["HIGH"],
        &["TRENDCLSPR"],
        &["VOLUME"],
        &["VALUE"],
        &["NUMTRADES"],
    ];

    fn from_cells(cells: &[&Value]) -> Result<Self, RowError> {
        let raw_date = as_text(cells[0], "TRADEDATE")?;
        let date = parse_date(raw_date).ok_or_else(|| RowError::BadTimestamp {
            column: "TRADEDATE",
            raw: raw_date.to_string(),
        })?;

        Ok(ActionRecord {
            date,
            close: opt_f64(cells[1], "CLOSE")?,
            open: opt_f64(cells[2], "OPEN")?,
            low: opt_f64(cells[3], "LOW")?,
            high: opt_f64(cells[4], "HIGH")?,
            trend_close_spread: opt_f64(cells[5], "TRENDCLSPR")?,
            volume: opt_i64(cells[6], "VOLUME")?,
            value: opt_f64(cells[7], "VALUE")?,
            num_trades: opt_i64(cells[8], "NUMTRADES")?,
        })
    }
}

impl TabularRecord for ElectricityRecord {
    const COLUMNS: &'static [&'static [&'static str]] = &[
        &["TIMESTAMP", "TIME_START", "DATETIME"],
        &["PRICE", "EUR_PER_KWH", "VALUE"],
    ];

    fn from_cells(cells: &[&Value]) -> Result<Self, RowError> {
        let raw = as_text(cells[0], "TIMESTAMP")?;
        let timestamp = parse_datetime(raw).ok_or_else(|| RowError::BadTimestamp {
            column: "TIMESTAMP",
            raw: raw.to_string(),
        })?;
        Ok(ElectricityRecord { timestamp, price: req_f64(cells[1], "PRICE")? })
    }
}

/// Electricity payloads come either as a `history` table or as an array of
/// `{"time_start": ..., "EUR_per_kWh": ...}` objects.
pub fn parse_electricity(payload: &RawPayload) -> Vec<ElectricityRecord> {
    let Some(items) = payload.as_array() else {
        return parse_table(payload);
    };

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            debug!(row = i, "dropping non-object electricity row");
            continue;
        };
        let field = |aliases: &[&str]| {
            obj.iter()
                .find(|(k, _)| aliases.iter().any(|a| k.eq_ignore_ascii_case(a)))
                .map(|(_, v)| v)
                .unwrap_or(&NULL)
        };
        let cells = [
            field(ElectricityRecord::COLUMNS[0]),
            field(ElectricityRecord::COLUMNS[1]),
        ];
        match ElectricityRecord::from_cells(&cells) {
            Ok(record) => records.push(record),
            Err(e) => debug!(row = i, reason = %e, "dropping malformed row"),
        }
    }
    records
}
