//! Market-data collaborators.
//!
//! Defines the `MarketDataProvider` and `LayerScorer` traits the coordinator
//! consumes. Every call on either trait costs quota on the upstream source;
//! the coordinator is responsible for asking the governor first.

pub mod remote;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CandidatePage, Layer, LayerReading, MarketConditions, ScanFilters};

/// Source of market regime and scan candidates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current volatility, volume, trend and session.
    async fn market_conditions(&self) -> Result<MarketConditions>;

    /// One page of raw candidates matching `filters`. Pages start at 0.
    async fn fetch_candidates(&self, filters: &ScanFilters, page: u32) -> Result<CandidatePage>;
}

/// One independent scoring layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LayerScorer: Send + Sync {
    fn layer(&self) -> Layer;

    /// Score `symbol` on this layer (0–100).
    async fn score(&self, symbol: &str) -> Result<LayerReading>;

    /// Upstream calls one `score` costs.
    fn api_calls(&self) -> u32 {
        1
    }
}
