//! Adaptive scan filters and opportunity scoring.
//!
//! Turns live market conditions into concrete `ScanFilters` and ranks scan
//! candidates with a weighted volume/momentum/liquidity score, so the fixed
//! scan budget is spent on the symbols that matter under current conditions.
//!
//! The filter pipeline is base → volatility → volume → trend → time-of-day.
//! Each step only touches the fields it owns; the time-of-day step runs last
//! and wins for the fields it sets.

use serde::Serialize;
use tracing::debug;

use crate::types::{MarketCandidate, MarketConditions, ScanFilters, ScanFocus, TimeOfDay, Trend};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const HIGH_VOLATILITY: f64 = 25.0;
const LOW_VOLATILITY: f64 = 15.0;

/// Aggregate volume below which the tape counts as thin.
const THIN_TAPE_VOLUME: f64 = 50_000_000.0;
const THIN_TAPE_MAX_PRICE: f64 = 200.0;

const RISK_ON_SECTORS: [&str; 3] = [
    "Technology",
    "Consumer Discretionary",
    "Communication Services",
];
const RISK_OFF_SECTORS: [&str; 3] = ["Utilities", "Consumer Staples", "Health Care"];

// Quality gate
const MAX_ABS_CHANGE_PERCENT: f64 = 100.0;
const MIN_GATE_VOLUME: f64 = 10_000.0;
const MIN_GATE_PRICE: f64 = 1.0;
const MAX_VOLUME_RATIO: f64 = 50.0;

// ---------------------------------------------------------------------------
// Time-of-day overrides
// ---------------------------------------------------------------------------

/// Fields a session overrides, applied after all other adjustments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOverride {
    pub min_daily_change_percent: f64,
    pub min_volume: u64,
    pub limit: usize,
    pub focus: Option<ScanFocus>,
}

/// Indexed by `session_index`.
const SESSION_OVERRIDES: [SessionOverride; 5] = [
    // preMarket
    SessionOverride {
        min_daily_change_percent: 5.0,
        min_volume: 500_000,
        limit: 20,
        focus: Some(ScanFocus::Gaps),
    },
    // openingBell
    SessionOverride {
        min_daily_change_percent: 3.0,
        min_volume: 2_000_000,
        limit: 40,
        focus: Some(ScanFocus::Momentum),
    },
    // midday
    SessionOverride {
        min_daily_change_percent: 1.5,
        min_volume: 1_000_000,
        limit: 25,
        focus: None,
    },
    // powerHour
    SessionOverride {
        min_daily_change_percent: 2.5,
        min_volume: 1_500_000,
        limit: 35,
        focus: Some(ScanFocus::Momentum),
    },
    // afterHours
    SessionOverride {
        min_daily_change_percent: 4.0,
        min_volume: 250_000,
        limit: 15,
        focus: Some(ScanFocus::News),
    },
];

fn session_index(session: TimeOfDay) -> usize {
    match session {
        TimeOfDay::PreMarket => 0,
        TimeOfDay::OpeningBell => 1,
        TimeOfDay::Midday => 2,
        TimeOfDay::PowerHour => 3,
        TimeOfDay::AfterHours => 4,
    }
}

/// Override values for a session.
pub fn session_override(session: TimeOfDay) -> &'static SessionOverride {
    &SESSION_OVERRIDES[session_index(session)]
}

// ---------------------------------------------------------------------------
// Score weights
// ---------------------------------------------------------------------------

/// Maximum points each component may contribute. Always sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreWeights {
    pub volume: f64,
    pub momentum: f64,
    pub liquidity: f64,
}

impl ScoreWeights {
    pub const BASE: ScoreWeights = ScoreWeights {
        volume: 30.0,
        momentum: 40.0,
        liquidity: 30.0,
    };
    /// Liquidity matters more in turbulence.
    pub const VOLATILE: ScoreWeights = ScoreWeights {
        volume: 25.0,
        momentum: 35.0,
        liquidity: 40.0,
    };
    /// Momentum dominates in a trending tape.
    pub const TRENDING: ScoreWeights = ScoreWeights {
        volume: 25.0,
        momentum: 50.0,
        liquidity: 25.0,
    };

    /// Weights for the given conditions. A trending tape takes precedence
    /// over high volatility.
    pub fn for_conditions(conditions: &MarketConditions) -> Self {
        if conditions.trend == Trend::Trending {
            Self::TRENDING
        } else if conditions.volatility > HIGH_VOLATILITY {
            Self::VOLATILE
        } else {
            Self::BASE
        }
    }
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// Why a candidate was dropped before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateRejection {
    /// |change| above 100%: almost certainly bad data.
    DataAnomaly,
    Illiquid,
    PennyStock,
    /// Relative volume spike too large to trust.
    SuspiciousSpike,
    NonFinite,
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateRejection::DataAnomaly => "data_anomaly",
            GateRejection::Illiquid => "illiquid",
            GateRejection::PennyStock => "penny_stock",
            GateRejection::SuspiciousSpike => "suspicious_spike",
            GateRejection::NonFinite => "non_finite",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Derives scan filters from conditions and scores candidates. Stateless.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveFilterEngine;

impl AdaptiveFilterEngine {
    pub fn new() -> Self {
        Self
    }

    /// Build filters for the given market conditions.
    pub fn adaptive_filters(&self, conditions: &MarketConditions) -> ScanFilters {
        let mut filters = ScanFilters::default();

        if conditions.volatility > HIGH_VOLATILITY {
            filters.min_volume = 2_000_000;
            filters.min_daily_change_percent = 3.0;
            filters.limit = 50;
        } else if conditions.volatility < LOW_VOLATILITY {
            filters.min_daily_change_percent = 1.5;
            filters.limit = 20;
        }

        if conditions.volume < THIN_TAPE_VOLUME {
            filters.max_price = filters.max_price.min(THIN_TAPE_MAX_PRICE);
        }

        let priority: &[&str] = match conditions.trend {
            Trend::RiskOn => &RISK_ON_SECTORS,
            Trend::RiskOff => &RISK_OFF_SECTORS,
            Trend::Trending | Trend::Neutral => &[],
        };
        filters.priority_sectors = priority.iter().map(|s| s.to_string()).collect();

        if let Some(session) = conditions.time_of_day {
            let o = session_override(session);
            filters.min_daily_change_percent = o.min_daily_change_percent;
            filters.min_volume = o.min_volume;
            filters.limit = o.limit;
            filters.focus = o.focus;
        }

        debug!(
            conditions = %conditions,
            min_volume = filters.min_volume,
            max_price = filters.max_price,
            min_change = filters.min_daily_change_percent,
            limit = filters.limit,
            "Adaptive filters computed"
        );

        filters
    }

    /// Drop candidates whose data cannot be trusted.
    pub fn quality_gate(&self, candidate: &MarketCandidate) -> Result<(), GateRejection> {
        let numbers = [
            candidate.price,
            candidate.volume,
            candidate.change_percent,
            candidate.dollar_volume,
            candidate.volume_ratio,
        ];
        if numbers.iter().any(|v| !v.is_finite()) {
            return Err(GateRejection::NonFinite);
        }
        if candidate.change_percent.abs() > MAX_ABS_CHANGE_PERCENT {
            return Err(GateRejection::DataAnomaly);
        }
        if candidate.volume < MIN_GATE_VOLUME {
            return Err(GateRejection::Illiquid);
        }
        if candidate.price < MIN_GATE_PRICE {
            return Err(GateRejection::PennyStock);
        }
        if candidate.volume_ratio > MAX_VOLUME_RATIO {
            return Err(GateRejection::SuspiciousSpike);
        }
        Ok(())
    }

    /// Weighted 0–100 ranking score. Pure.
    pub fn opportunity_score(
        &self,
        candidate: &MarketCandidate,
        conditions: &MarketConditions,
    ) -> u32 {
        let w = ScoreWeights::for_conditions(conditions);

        let component = |raw: f64, cap: f64| {
            if raw.is_finite() {
                raw.clamp(0.0, cap)
            } else {
                0.0
            }
        };

        let volume = component(candidate.volume_ratio * 10.0, w.volume);
        let momentum = component(candidate.change_percent.abs() * 4.0, w.momentum);
        let liquidity = component(candidate.dollar_volume / 1_000_000.0, w.liquidity);

        (volume + momentum + liquidity).round() as u32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
