//! REST adapter for the upstream market-data service.
//!
//! Endpoints (JSON, bearer auth when a key is configured):
//! - `GET {base}/v1/market/conditions`
//! - `GET {base}/v1/market/candidates?exchange=..&minVolume=..&page=N`
//!   (plus `prioritySectors` and `focus` when the filters set them)
//! - `GET {base}/v1/scores/{layer}/{symbol}`
//!
//! The adapter does no quota accounting of its own; callers go through the
//! governor before every request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{LayerScorer, MarketDataProvider};
use crate::config::DataSourceConfig;
use crate::types::{CandidatePage, Layer, LayerReading, MarketConditions, ScanFilters};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const USER_AGENT: &str = "THub/0.1.0 (scan-core)";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the market-data service.
pub struct RemoteDataSource {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl RemoteDataSource {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client for market data")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(cfg: &DataSourceConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            cfg.api_key(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    /// One scorer per layer, all sharing this client.
    pub fn scorers(self: &Arc<Self>) -> [Arc<dyn LayerScorer>; 3] {
        [Layer::Technical, Layer::Sentiment, Layer::Liquidity].map(|layer| {
            Arc::new(RemoteLayerScorer {
                source: Arc::clone(self),
                layer,
            }) as Arc<dyn LayerScorer>
        })
    }

    fn candidates_url(&self, filters: &ScanFilters, page: u32) -> String {
        let mut params: Vec<(&str, String)> = vec![
            ("exchange", filters.exchange.clone()),
            ("minVolume", filters.min_volume.to_string()),
            ("minPrice", filters.min_price.to_string()),
            ("maxPrice", filters.max_price.to_string()),
            ("minChange", filters.min_daily_change_percent.to_string()),
            ("limit", filters.limit.to_string()),
            ("page", page.to_string()),
        ];
        if !filters.exclude_sectors.is_empty() {
            let joined: Vec<&str> = filters.exclude_sectors.iter().map(String::as_str).collect();
            params.push(("excludeSectors", joined.join(",")));
        }
        if !filters.priority_sectors.is_empty() {
            params.push(("prioritySectors", filters.priority_sectors.join(",")));
        }
        if let Some(focus) = filters.focus {
            params.push(("focus", focus.to_string()));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}/v1/market/candidates?{query}", self.base_url)
    }

    fn score_url(&self, layer: Layer, symbol: &str) -> String {
        format!(
            "{}/v1/scores/{}/{}",
            self.base_url,
            layer,
            urlencoding::encode(symbol)
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "Market data request");

        let mut req = self.http.get(url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.context("Market data request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Market data API error {status}: {body}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse market data response from {url}"))
    }
}

#[async_trait]
impl MarketDataProvider for RemoteDataSource {
    async fn market_conditions(&self) -> Result<MarketConditions> {
        let url = format!("{}/v1/market/conditions", self.base_url);
        self.get_json(&url).await
    }

    async fn fetch_candidates(&self, filters: &ScanFilters, page: u32) -> Result<CandidatePage> {
        let url = self.candidates_url(filters, page);
        self.get_json(&url).await
    }
}

/// `LayerScorer` backed by the remote score endpoint for one layer.
pub struct RemoteLayerScorer {
    source: Arc<RemoteDataSource>,
    layer: Layer,
}

#[async_trait]
impl LayerScorer for RemoteLayerScorer {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn score(&self, symbol: &str) -> Result<LayerReading> {
        let url = self.source.score_url(self.layer, symbol);
        self.source
            .get_json(&url)
            .await
            .with_context(|| format!("{} score for {symbol}", self.layer))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AdaptiveFilterEngine;
    use crate::types::{TimeOfDay, Trend};

    fn source() -> RemoteDataSource {
        RemoteDataSource::new("http://data.local/", None, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let s = source();
        assert_eq!(
            s.score_url(Layer::Sentiment, "BRK.B"),
            "http://data.local/v1/scores/sentiment/BRK.B"
        );
    }

    #[test]
    fn test_candidates_url_carries_filters() {
        let s = source();
        let filters = ScanFilters::default();
        let url = s.candidates_url(&filters, 2);
        assert!(url.starts_with("http://data.local/v1/market/candidates?exchange=US"));
        assert!(url.contains("minVolume=1000000"));
        assert!(url.contains("page=2"));
        assert!(url.contains("excludeSectors=ADR%2CREIT"));
        assert!(!url.contains("focus="));
        assert!(!url.contains("prioritySectors="));
    }

    #[test]
    fn test_candidates_url_carries_session_focus_and_priority() {
        let s = source();
        let conditions = MarketConditions {
            volatility: 30.0,
            volume: 100_000_000.0,
            trend: Trend::RiskOn,
            time_of_day: Some(TimeOfDay::PreMarket),
        };
        let filters = AdaptiveFilterEngine::new().adaptive_filters(&conditions);
        let url = s.candidates_url(&filters, 0);

        assert!(url.contains("minChange=5"));
        assert!(url.contains("focus=gaps"));
        assert!(url.contains(
            "prioritySectors=Technology%2CConsumer%20Discretionary%2CCommunication%20Services"
        ));
    }

    #[test]
    fn test_scorers_cover_every_layer() {
        let s = Arc::new(source());
        let layers: Vec<Layer> = s.scorers().iter().map(|sc| sc.layer()).collect();
        assert_eq!(layers, vec![Layer::Technical, Layer::Sentiment, Layer::Liquidity]);
        assert!(s.scorers().iter().all(|sc| sc.api_calls() == 1));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let s = RemoteDataSource::new("http://127.0.0.1:1", None, Duration::from_millis(200))
            .unwrap();
        assert!(s.market_conditions().await.is_err());
    }
}
