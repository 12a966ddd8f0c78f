use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::models::{FetchWindow, RawPayload, SeriesRecord};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

pub mod electricity;
pub mod moex;

/// Outcome of one successfully completed HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowFetch {
    Payload(RawPayload),
    /// Non-200 status, empty body or unusable document. Expected, not an error.
    NoData { reason: String },
}

/// Fetch/parse capability set for one record variant.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    type Record: SeriesRecord;

    fn name(&self) -> &str;

    /// One GET for one window. `Err` only for transport failures.
    async fn fetch_window(&self, window: &FetchWindow) -> Result<WindowFetch, FetchError>;

    fn parse_payload(&self, payload: &RawPayload) -> Vec<Self::Record>;
}

/// Provider date format: `YYYY-M-D`, no zero padding.
pub fn provider_date(date: NaiveDate) -> String {
    format!("{}-{}-{}", date.year(), date.month(), date.day())
}

/// Thin HTTP client shared by the concrete sources. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: &str, cfg: &ProviderConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent("market-ingest/0.1")
            .timeout(cfg.request_timeout)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn window_url(&self, window: &FetchWindow) -> String {
        format!(
            "{}/{}/{}.json?from={}&till={}&meta=off",
            self.base_url,
            window.category.path(),
            window.entity_id,
            provider_date(window.from_date),
            provider_date(window.till_date)
        )
    }

    pub async fn fetch(&self, window: &FetchWindow) -> Result<WindowFetch, FetchError> {
        let url = self.window_url(window);
        debug!(url = %url, "requesting window");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| FetchError::Transport { url: url.clone(), source })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|source| FetchError::Transport { url: url.clone(), source })?;

        let outcome = classify_response(status, &body);
        if let WindowFetch::NoData { reason } = &outcome {
            info!(window = %window, reason = %reason, "no data for window");
        }
        Ok(outcome)
    }
}

/// Classify a completed exchange. Anything other than a 200 with a non-empty JSON
/// document degrades to `NoData`.
pub fn classify_response(status: StatusCode, body: &str) -> WindowFetch {
    if status != StatusCode::OK {
        return WindowFetch::NoData { reason: format!("HTTP {}", status.as_u16()) };
    }
    if body.trim().is_empty() {
        return WindowFetch::NoData { reason: "empty body".to_string() };
    }

    match serde_json::from_str::<RawPayload>(body) {
        Ok(payload) if is_empty_document(&payload) => {
            WindowFetch::NoData { reason: "empty document".to_string() }
        }
        Ok(payload) => WindowFetch::Payload(payload),
        Err(e) => {
            warn!(error = %e, "provider returned a non-JSON body");
            WindowFetch::NoData { reason: format!("invalid JSON: {}", e) }
        }
    }
}

fn is_empty_document(payload: &RawPayload) -> bool {
    match payload {
        RawPayload::Null => true,
        RawPayload::Object(map) => map.is_empty(),
        RawPayload::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Category;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn provider_config() -> ProviderConfig {
        ProviderConfig {
            request_timeout: Duration::from_secs(5),
            ..ProviderConfig::default()
        }
    }

    /// Serve `router` on an ephemeral local port and return its base URL.
    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn window(entity: &str, category: Category) -> FetchWindow {
        FetchWindow {
            entity_id: entity.to_string(),
            category,
            from_date: date(2023, 4, 3),
            till_date: date(2024, 8, 22),
        }
    }

    #[test]
    fn builds_deterministic_urls() {
        let client = ProviderClient::new("https://iss.moex.com/iss/history/engines/", &provider_config()).unwrap();
        assert_eq!(
            client.window_url(&window("SBER", Category::Shares)),
            "https://iss.moex.com/iss/history/engines/stock/markets/shares/boards/TQBR/securities/\
             SBER.json?from=2023-4-3&till=2024-8-22&meta=off"
        );
        assert_eq!(
            client.window_url(&window("USD_RUB", Category::Currency)),
            "https://iss.moex.com/iss/history/engines/currency/markets/selt/boards/CETS/securities/\
             USD_RUB.json?from=2023-4-3&till=2024-8-22&meta=off"
        );
    }

    #[test]
    fn classifies_responses() {
        let ok = classify_response(StatusCode::OK, r#"{"history": {"columns": [], "data": []}}"#);
        assert!(matches!(ok, WindowFetch::Payload(_)));

        for (status, body) in [
            (StatusCode::INTERNAL_SERVER_ERROR, r#"{"history": {}}"#),
            (StatusCode::NOT_FOUND, ""),
            (StatusCode::OK, ""),
            (StatusCode::OK, "   \n"),
            (StatusCode::OK, "{}"),
            (StatusCode::OK, "null"),
            (StatusCode::OK, "<html>maintenance</html>"),
        ] {
            assert!(
                matches!(classify_response(status, body), WindowFetch::NoData { .. }),
                "{} {:?}",
                status,
                body
            );
        }
    }

    #[tokio::test]
    async fn fetch_hits_provider_path_and_query() {
        let router = Router::new().route(
            "/stock/markets/shares/boards/TQBR/securities/:file",
            get(|Path(file): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(file, "SBER.json");
                assert_eq!(q.get("from").map(String::as_str), Some("2023-4-3"));
                assert_eq!(q.get("till").map(String::as_str), Some("2024-8-22"));
                assert_eq!(q.get("meta").map(String::as_str), Some("off"));
                r#"{"history": {"columns": ["TRADEDATE"], "data": [["2023-04-03"]]}}"#
            }),
        );
        let base = serve(router).await;
        let client = ProviderClient::new(&base, &provider_config()).unwrap();

        let fetched = client.fetch(&window("SBER", Category::Shares)).await.unwrap();
        let WindowFetch::Payload(payload) = fetched else {
            panic!("expected payload, got {:?}", fetched);
        };
        assert_eq!(payload["history"]["data"][0][0], "2023-04-03");
    }

    #[tokio::test]
    async fn server_error_and_empty_body_are_no_data() {
        let router = Router::new()
            .route(
                "/stock/markets/shares/boards/TQBR/securities/:file",
                get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/currency/markets/selt/boards/CETS/securities/:file",
                get(|| async { "" }),
            );
        let base = serve(router).await;
        let client = ProviderClient::new(&base, &provider_config()).unwrap();

        let failed = client.fetch(&window("SBER", Category::Shares)).await.unwrap();
        assert_eq!(failed, WindowFetch::NoData { reason: "HTTP 500".to_string() });

        let empty = client.fetch(&window("USD_RUB", Category::Currency)).await.unwrap();
        assert_eq!(empty, WindowFetch::NoData { reason: "empty body".to_string() });
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ProviderClient::new(&format!("http://{}", addr), &provider_config()).unwrap();
        let err = client.fetch(&window("SBER", Category::Shares)).await;
        assert!(matches!(err, Err(FetchError::Transport { .. })));
    }
}
