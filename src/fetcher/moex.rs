use super::{ProviderClient, SeriesSource, WindowFetch};
use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::models::{ActionRecord, FetchWindow, RawPayload};
use crate::parser::parse_table;
use async_trait::async_trait;

/// Exchange trading history (shares, bonds, currency pairs).
pub struct MoexFetcher {
    client: ProviderClient,
}

impl MoexFetcher {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, FetchError> {
        Ok(Self { client: ProviderClient::new(&cfg.base_url, cfg)? })
    }

    pub fn with_base_url(base_url: &str, cfg: &ProviderConfig) -> Result<Self, FetchError> {
        Ok(Self { client: ProviderClient::new(base_url, cfg)? })
    }
}

#[async_trait]
impl SeriesSource for MoexFetcher {
    type Record = ActionRecord;

    fn name(&self) -> &str {
        "moex"
    }

    async fn fetch_window(&self, window: &FetchWindow) -> Result<WindowFetch, FetchError> {
        self.client.fetch(window).await
    }

    fn parse_payload(&self, payload: &RawPayload) -> Vec<ActionRecord> {
        parse_table(payload)
    }
}
