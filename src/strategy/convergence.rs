//! Convergence of independent layer scores into one signal.
//!
//! Technical, sentiment and liquidity scores are fused with fixed weights
//! into a 0–100 convergence score, which is then banded into a
//! `SignalStrength`. Everything here is pure: identical inputs always give
//! identical outputs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{Direction, LayerScores, Signal, SignalStrength};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Relative weight of each layer. Normalised at use, so they need not sum
/// to one.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LayerWeights {
    pub technical: f64,
    pub sentiment: f64,
    pub liquidity: f64,
}

impl LayerWeights {
    /// Equal weighting.
    pub const EQUAL: LayerWeights = LayerWeights {
        technical: 1.0,
        sentiment: 1.0,
        liquidity: 1.0,
    };

    fn total(&self) -> f64 {
        self.technical + self.sentiment + self.liquidity
    }
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self::EQUAL
    }
}

/// Lower bounds of each strength band.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct StrengthThresholds {
    pub strong_buy: f64,
    pub buy: f64,
    pub hold: f64,
    pub sell: f64,
}

impl Default for StrengthThresholds {
    fn default() -> Self {
        Self {
            strong_buy: 80.0,
            buy: 65.0,
            hold: 45.0,
            sell: 30.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvergenceConfig {
    pub weights: LayerWeights,
    pub thresholds: StrengthThresholds,
    /// How long a signal stays active.
    pub signal_ttl: Option<Duration>,
}

/// Default signal lifetime.
pub const DEFAULT_SIGNAL_TTL_MINS: i64 = 240;

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Fused score and its classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Convergence {
    pub score: f64,
    pub strength: SignalStrength,
}

pub struct ConvergenceAnalyzer {
    config: ConvergenceConfig,
}

impl ConvergenceAnalyzer {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Weighted combination of the three layers, rounded to one decimal.
    ///
    /// Scores are clamped to 0–100 first. With degenerate (zero or
    /// negative) weights the analyzer falls back to equal weighting.
    pub fn convergence_score(&self, scores: &LayerScores) -> f64 {
        let w = if self.config.weights.total() > 0.0
            && self.config.weights.technical >= 0.0
            && self.config.weights.sentiment >= 0.0
            && self.config.weights.liquidity >= 0.0
        {
            self.config.weights
        } else {
            LayerWeights::EQUAL
        };

        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        let weighted = clamp(scores.technical) * w.technical
            + clamp(scores.sentiment) * w.sentiment
            + clamp(scores.liquidity) * w.liquidity;

        let score = weighted / w.total();
        (score * 10.0).round() / 10.0
    }

    /// Band a score. A downward move mirrors the classification.
    pub fn classify(&self, score: f64, direction: Option<Direction>) -> SignalStrength {
        let t = &self.config.thresholds;
        let strength = if score >= t.strong_buy {
            SignalStrength::StrongBuy
        } else if score >= t.buy {
            SignalStrength::Buy
        } else if score >= t.hold {
            SignalStrength::Hold
        } else if score >= t.sell {
            SignalStrength::Sell
        } else {
            SignalStrength::StrongSell
        };

        match direction {
            Some(Direction::Down) => strength.flipped(),
            Some(Direction::Up) | None => strength,
        }
    }

    pub fn compute(&self, scores: &LayerScores, direction: Option<Direction>) -> Convergence {
        let score = self.convergence_score(scores);
        Convergence {
            score,
            strength: self.classify(score, direction),
        }
    }

    /// Build a fresh signal stamped at `now`.
    pub fn build_signal(
        &self,
        symbol: &str,
        scores: LayerScores,
        direction: Option<Direction>,
        now: DateTime<Utc>,
    ) -> Signal {
        let convergence = self.compute(&scores, direction);
        let ttl = self
            .config
            .signal_ttl
            .unwrap_or_else(|| Duration::minutes(DEFAULT_SIGNAL_TTL_MINS));

        debug!(
            symbol,
            score = convergence.score,
            strength = %convergence.strength,
            direction = ?direction,
            "Convergence computed"
        );

        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            convergence_score: convergence.score,
            signal_strength: convergence.strength,
            layer_scores: scores,
            created_at: now,
            expires_at: now + ttl,
            viewed: false,
            saved: false,
        }
    }
}

impl Default for ConvergenceAnalyzer {
    fn default() -> Self {
        Self::new(ConvergenceConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
