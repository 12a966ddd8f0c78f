use super::{ProviderClient, SeriesSource, WindowFetch};
use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::models::{ElectricityRecord, FetchWindow, RawPayload};
use crate::parser::parse_electricity;
use async_trait::async_trait;

/// Regional spot electricity prices.
pub struct ElectricityFetcher {
    client: ProviderClient,
}

impl ElectricityFetcher {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, FetchError> {
        Ok(Self { client: ProviderClient::new(&cfg.electricity_base_url, cfg)? })
    }

    pub fn with_base_url(base_url: &str, cfg: &ProviderConfig) -> Result<Self, FetchError> {
        Ok(Self { client: ProviderClient::new(base_url, cfg)? })
    }
}

#[async_trait]
impl SeriesSource for ElectricityFetcher {
    type Record = ElectricityRecord;

    fn name(&self) -> &str {
        "electricity"
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<WindowFetch, FetchError> {
        self.client.fetch(window).await
    }

    fn parse_payload(&self, payload: &RawPayload) -> Vec<ElectricityRecord> {
        parse_electricity(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tests::{provider_config, serve};
    use crate::models::Category;
    use axum::routing::get;
    use axum::Router;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn parses_tabular_prices() {
        let router = Router::new().route(
            "/electricity/prices/:file",
            get(|| async {
                r#"{"history": {"columns": ["REGION", "PRICE", "TIMESTAMP"],
                    "data": [["SE3", 0.12, "2024-02-01 00:00:00"], ["SE3", 0.15, "2024-02-01 01:00:00"]]}}"#
            }),
        );
        let base = serve(router).await;
        let fetcher = ElectricityFetcher::with_base_url(&base, &provider_config()).unwrap();
        let window = FetchWindow {
            entity_id: "SE3".to_string(),
            category: Category::Electricity,
            from_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            till_date: NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
        };

        let WindowFetch::Payload(payload) = fetcher.fetch_window(&window).await.unwrap() else {
            panic!("expected payload");
        };
        let records = fetcher.parse_payload(&payload);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].price, 0.15);
        assert_eq!(
            records[1].timestamp,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap().and_hms_opt(1, 0, 0).unwrap()
        );
    }
}
