use crate::error::ConfigError;
use crate::models::{Category, EntityDescriptor};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PROVIDER_BASE: &str = "https://iss.moex.com/iss/history/engines";

const DEFAULT_SHARES: &[&str] = &[
    "SBER", "GAZP", "LUKH", "ROSN", "YNDX", "AFTL", "MTSS", "NLMK", "PLZL", "TATN", "GMKN", "MGNT",
];
const DEFAULT_BONDS: &[&str] = &[
    "RU000A0ZZZ01",
    "RU000A101AM1",
    "RU000A0ZZZ99",
    "RU000A1008V9",
    "RU000A0ZZZ77",
];
const DEFAULT_CURRENCIES: &[&str] = &[
    "USD_RUB", "EUR_RUB", "CNY_RUB", "CHF_RUB", "GPB_RUB", "JPY_RUB", "BYN_RUB", "TRY_RUB",
    "KZT_RUB",
];

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub electricity_base_url: String,
    pub request_timeout: Duration,
    pub max_span_days: u32,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Orchestrator knobs. Fetch concurrency is capped independently of entity
/// concurrency so an aggressively throttling provider can be respected
/// without starving the database side.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub entity_concurrency: usize,
    pub fetch_concurrency: usize,
    pub lookback_days: u32,
    pub retention_days: u32,
    pub batch_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub run: RunConfig,
    pub schedule: String,
    pub entities: Vec<EntityDescriptor>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entity_concurrency: 4,
            fetch_concurrency: 2,
            lookback_days: 1095,
            retention_days: 1095,
            batch_timeout: Duration::from_secs(600),
            retry: RetryConfig {
                attempts: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_millis(5_000),
            },
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVIDER_BASE.to_string(),
            electricity_base_url: DEFAULT_PROVIDER_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
            max_span_days: 100,
        }
    }
}

impl IngestConfig {
    /// Load configuration from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Unset keys fall back to defaults;
    /// set-but-invalid keys are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let run_defaults = RunConfig::default();
        let provider_defaults = ProviderConfig::default();

        let base_url = lookup("INGEST_PROVIDER_BASE")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(provider_defaults.base_url);
        let electricity_base_url = lookup("INGEST_ELECTRICITY_BASE")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());

        let database = DatabaseConfig {
            url: lookup("INGEST_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://market_data.db?mode=rwc".to_string()),
            max_connections: parse_num(&lookup, "INGEST_DB_MAX_CONNECTIONS", 5u32, 1)?,
            acquire_timeout: Duration::from_secs(parse_num(
                &lookup,
                "INGEST_DB_ACQUIRE_TIMEOUT_SECS",
                10u64,
                1,
            )?),
        };

        let provider = ProviderConfig {
            base_url,
            electricity_base_url,
            request_timeout: Duration::from_secs(parse_num(
                &lookup,
                "INGEST_HTTP_TIMEOUT_SECS",
                provider_defaults.request_timeout.as_secs(),
                1,
            )?),
            max_span_days: parse_num(
                &lookup,
                "INGEST_MAX_SPAN_DAYS",
                provider_defaults.max_span_days,
                1,
            )?,
        };

        let base_delay_ms = parse_num(
            &lookup,
            "INGEST_RETRY_BASE_MS",
            run_defaults.retry.base_delay.as_millis() as u64,
            1,
        )?;
        let max_delay_ms = parse_num(
            &lookup,
            "INGEST_RETRY_MAX_MS",
            run_defaults.retry.max_delay.as_millis() as u64,
            1,
        )?;

        let run = RunConfig {
            entity_concurrency: parse_num(
                &lookup,
                "INGEST_ENTITY_CONCURRENCY",
                run_defaults.entity_concurrency,
                1,
            )?,
            fetch_concurrency: parse_num(
                &lookup,
                "INGEST_FETCH_CONCURRENCY",
                run_defaults.fetch_concurrency,
                1,
            )?,
            lookback_days: parse_num(&lookup, "INGEST_LOOKBACK_DAYS", run_defaults.lookback_days, 0)?,
            retention_days: parse_num(
                &lookup,
                "INGEST_RETENTION_DAYS",
                run_defaults.retention_days,
                0,
            )?,
            batch_timeout: Duration::from_secs(parse_num(
                &lookup,
                "INGEST_BATCH_TIMEOUT_SECS",
                run_defaults.batch_timeout.as_secs(),
                1,
            )?),
            retry: RetryConfig {
                attempts: parse_num(&lookup, "INGEST_FETCH_RETRIES", run_defaults.retry.attempts, 1)?,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
            },
        };

        // Distinct ids that sanitize to one table would overwrite each other.
        let mut entities = Vec::new();
        let mut tables: HashMap<String, String> = HashMap::new();
        for (key, category, defaults) in [
            ("INGEST_SHARES", Category::Shares, DEFAULT_SHARES),
            ("INGEST_BONDS", Category::Bonds, DEFAULT_BONDS),
            ("INGEST_CURRENCIES", Category::Currency, DEFAULT_CURRENCIES),
            ("INGEST_ELECTRICITY_REGIONS", Category::Electricity, &[][..]),
        ] {
            let ids: Vec<String> = match lookup(key) {
                Some(list) => split_list(&list),
                None => defaults.iter().map(|s| s.to_string()).collect(),
            };
            for id in ids {
                let entity = EntityDescriptor::new(id, category);
                match tables.get(&entity.table_name()) {
                    Some(existing) if *existing == entity.id => continue,
                    Some(existing) => {
                        return Err(ConfigError::Invalid {
                            key,
                            value: entity.id.clone(),
                            reason: format!("shares table {} with '{}'", entity.table_name(), existing),
                        })
                    }
                    None => {
                        tables.insert(entity.table_name(), entity.id.clone());
                        entities.push(entity);
                    }
                }
            }
        }

        Ok(Self {
            database,
            provider,
            run,
            schedule: lookup("INGEST_SCHEDULE").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            entities,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_num<F, T>(lookup: &F, key: &'static str, default: T, min: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value < min {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: format!("must be at least {}", min),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_cover_builtin_tickers() {
        let cfg = IngestConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.provider.max_span_days, 100);
        assert_eq!(cfg.run.fetch_concurrency, 2);
        assert!(cfg
            .entities
            .contains(&EntityDescriptor::new("SBER", Category::Shares)));
        assert!(cfg
            .entities
            .contains(&EntityDescriptor::new("USD_RUB", Category::Currency)));
        assert!(cfg.entities.iter().all(|e| e.category != Category::Electricity));
    }

    #[test]
    fn overrides_entity_lists_and_numbers() {
        let cfg = IngestConfig::from_lookup(lookup_from(&[
            ("INGEST_SHARES", "SBER, GAZP"),
            ("INGEST_BONDS", ""),
            ("INGEST_CURRENCIES", ""),
            ("INGEST_ELECTRICITY_REGIONS", "SE3"),
            ("INGEST_MAX_SPAN_DAYS", "50"),
            ("INGEST_PROVIDER_BASE", "http://localhost:9000/"),
        ]))
        .unwrap();

        assert_eq!(cfg.provider.max_span_days, 50);
        assert_eq!(cfg.provider.base_url, "http://localhost:9000");
        assert_eq!(cfg.provider.electricity_base_url, "http://localhost:9000");
        assert_eq!(
            cfg.entities,
            vec![
                EntityDescriptor::new("SBER", Category::Shares),
                EntityDescriptor::new("GAZP", Category::Shares),
                EntityDescriptor::new("SE3", Category::Electricity),
            ]
        );
    }

    #[test]
    fn rejects_invalid_numbers() {
        let err = IngestConfig::from_lookup(lookup_from(&[("INGEST_MAX_SPAN_DAYS", "abc")]));
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { key: "INGEST_MAX_SPAN_DAYS", .. })
        ));

        let zero = IngestConfig::from_lookup(lookup_from(&[("INGEST_FETCH_CONCURRENCY", "0")]));
        assert!(zero.is_err());
    }

    #[test]
    fn entity_ids_must_map_to_distinct_tables() {
        let repeated = IngestConfig::from_lookup(lookup_from(&[
            ("INGEST_SHARES", "SBER,SBER"),
            ("INGEST_BONDS", ""),
            ("INGEST_CURRENCIES", "USD_RUB"),
        ]))
        .unwrap();
        assert_eq!(repeated.entities.len(), 2);

        let clash = IngestConfig::from_lookup(lookup_from(&[
            ("INGEST_SHARES", ""),
            ("INGEST_BONDS", ""),
            ("INGEST_CURRENCIES", "USD_RUB,usd_rub"),
        ]));
        assert!(matches!(
            clash,
            Err(ConfigError::Invalid { key: "INGEST_CURRENCIES", ref value, .. }) if value == "usd_rub"
        ));

        let dotted = IngestConfig::from_lookup(lookup_from(&[("INGEST_CURRENCIES", "USD_RUB,USD.RUB")]));
        assert!(dotted.is_err());
    }
}
