//! Mock market-data source for integration testing.
//!
//! Provides deterministic `MarketDataProvider` and `LayerScorer`
//! implementations backed by in-memory tables, with switches to force
//! failures and add latency.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thub::data::{LayerScorer, MarketDataProvider};
use thub::types::*;

/// A mock market for deterministic testing.
pub struct MockMarket {
    conditions: MarketConditions,
    candidates: Vec<MarketCandidate>,
    page_size: usize,
    /// If set, all operations will return this error.
    force_error: Arc<Mutex<Option<String>>>,
    pub candidate_calls: AtomicU32,
}

impl MockMarket {
    pub fn new(conditions: MarketConditions, candidates: Vec<MarketCandidate>) -> Self {
        Self {
            conditions,
            candidates,
            page_size: 3,
            force_error: Arc::new(Mutex::new(None)),
            candidate_calls: AtomicU32::new(0),
        }
    }

    /// Force all subsequent operations to return an error.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }

    /// A tape with good names mixed with every kind of bad data.
    pub fn default_candidates() -> Vec<MarketCandidate> {
        vec![
            candidate("NVDA", 480.0, 40_000_000.0, 6.5, 3.1, Some("Technology")),
            candidate("AMD", 150.0, 25_000_000.0, 4.2, 2.4, Some("Technology")),
            candidate("XOM", 110.0, 12_000_000.0, 2.6, 1.4, Some("Energy")),
            candidate("O", 55.0, 5_000_000.0, 3.0, 1.8, Some("REIT")),
            candidate("BADDATA", 20.0, 3_000_000.0, 180.0, 2.0, None),
            candidate("PENNY", 0.4, 90_000_000.0, 25.0, 4.0, None),
            candidate("THIN", 12.0, 4_000.0, 8.0, 2.0, None),
            candidate("PUMP", 9.0, 30_000_000.0, 45.0, 120.0, None),
            candidate("SLOW", 80.0, 2_000_000.0, 0.4, 1.0, Some("Utilities")),
        ]
    }
}

pub fn candidate(
    symbol: &str,
    price: f64,
    volume: f64,
    change_percent: f64,
    volume_ratio: f64,
    sector: Option<&str>,
) -> MarketCandidate {
    MarketCandidate {
        symbol: symbol.to_string(),
        price,
        volume,
        change_percent,
        dollar_volume: price * volume,
        volume_ratio,
        sector: sector.map(String::from),
        opportunity_score: 0,
    }
}

#[async_trait]
impl MarketDataProvider for MockMarket {
    async fn market_conditions(&self) -> Result<MarketConditions> {
        self.check_error()?;
        Ok(self.conditions.clone())
    }

    async fn fetch_candidates(&self, _filters: &ScanFilters, page: u32) -> Result<CandidatePage> {
        self.check_error()?;
        self.candidate_calls.fetch_add(1, Ordering::SeqCst);

        let start = page as usize * self.page_size;
        let end = (start + self.page_size).min(self.candidates.len());
        let candidates = self.candidates.get(start..end).unwrap_or_default().to_vec();
        let next_page = (end < self.candidates.len()).then_some(page + 1);

        Ok(CandidatePage {
            candidates,
            total_symbols: self.candidates.len(),
            next_page,
        })
    }
}

/// A scoring layer with fixed per-symbol scores.
pub struct MockScorer {
    layer: Layer,
    default_score: f64,
    scores: HashMap<String, f64>,
    failing: HashSet<String>,
    latency: Duration,
    pub calls: AtomicU32,
}

impl MockScorer {
    pub fn new(layer: Layer, default_score: f64) -> Self {
        Self {
            layer,
            default_score,
            scores: HashMap::new(),
            failing: HashSet::new(),
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_score(mut self, symbol: &str, score: f64) -> Self {
        self.scores.insert(symbol.to_string(), score);
        self
    }

    /// Every call for `symbol` fails.
    pub fn failing_on(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl LayerScorer for MockScorer {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn score(&self, symbol: &str) -> Result<LayerReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.contains(symbol) {
            return Err(anyhow!("{} feed unavailable for {symbol}", self.layer));
        }
        Ok(LayerReading {
            score: self.scores.get(symbol).copied().unwrap_or(self.default_score),
            direction: None,
        })
    }
}
