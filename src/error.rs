//! Error taxonomy for the ingestion pipeline.
//!
//! Window-level "no data" and row-level parse failures are not errors here:
//! they are absorbed where they happen. Only transport, store, validation and
//! configuration failures travel as `Err`.

use thiserror::Error;

/// Failure of a single outbound provider call before a response was classified.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("store task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entity id must not be empty")]
    EmptyEntityId,

    #[error("entity id '{0}' contains unsupported characters")]
    InvalidEntityId(String),

    #[error("date range is inverted: from {from} is after till {till}")]
    InvertedRange { from: String, till: String },

    #[error("window span must be at least one day")]
    ZeroSpan,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Why one provider row was dropped. Never aborts the rest of the payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("row is not an array")]
    NotArray,

    #[error("missing cell for column {0}")]
    MissingCell(&'static str),

    #[error("column {column}: expected {expected}, got {found}")]
    WrongType {
        column: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("column {column}: unparseable timestamp '{raw}'")]
    BadTimestamp { column: &'static str, raw: String },
}
