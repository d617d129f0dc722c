//! Shared types for the THub scan core.
//!
//! These types form the data model used across all modules.
//! They are kept free of behaviour that needs collaborators so that the
//! quota, filter, strategy and engine modules can depend on them without
//! circular references.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market conditions
// ---------------------------------------------------------------------------

/// Broad market regime reported alongside volatility and volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Trend {
    RiskOn,
    RiskOff,
    Trending,
    #[default]
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::RiskOn => write!(f, "risk-on"),
            Trend::RiskOff => write!(f, "risk-off"),
            Trend::Trending => write!(f, "trending"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

/// US equity session segments, in Eastern time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeOfDay {
    PreMarket,
    OpeningBell,
    Midday,
    PowerHour,
    AfterHours,
}

impl TimeOfDay {
    pub const ALL: [TimeOfDay; 5] = [
        TimeOfDay::PreMarket,
        TimeOfDay::OpeningBell,
        TimeOfDay::Midday,
        TimeOfDay::PowerHour,
        TimeOfDay::AfterHours,
    ];

    /// Classify a wall-clock time in US/Eastern.
    ///
    /// Returns `None` overnight (20:00–04:00), when no session is open.
    pub fn from_eastern_time(time: NaiveTime) -> Option<Self> {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();

        if time < hm(4, 0) || time >= hm(20, 0) {
            None
        } else if time < hm(9, 30) {
            Some(TimeOfDay::PreMarket)
        } else if time < hm(10, 0) {
            Some(TimeOfDay::OpeningBell)
        } else if time < hm(15, 0) {
            Some(TimeOfDay::Midday)
        } else if time < hm(16, 0) {
            Some(TimeOfDay::PowerHour)
        } else {
            Some(TimeOfDay::AfterHours)
        }
    }

    /// Whether the regular session (09:30–16:00) is open.
    pub fn is_regular_session(&self) -> bool {
        matches!(
            self,
            TimeOfDay::OpeningBell | TimeOfDay::Midday | TimeOfDay::PowerHour
        )
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeOfDay::PreMarket => "preMarket",
            TimeOfDay::OpeningBell => "openingBell",
            TimeOfDay::Midday => "midday",
            TimeOfDay::PowerHour => "powerHour",
            TimeOfDay::AfterHours => "afterHours",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-', ' '], "").as_str() {
            "premarket" => Ok(TimeOfDay::PreMarket),
            "openingbell" | "open" => Ok(TimeOfDay::OpeningBell),
            "midday" => Ok(TimeOfDay::Midday),
            "powerhour" => Ok(TimeOfDay::PowerHour),
            "afterhours" => Ok(TimeOfDay::AfterHours),
            other => Err(format!("Unknown time of day: {other}")),
        }
    }
}

/// Live market-condition signals used to adapt scan parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketConditions {
    /// VIX-like volatility index.
    pub volatility: f64,
    /// Aggregate market volume (shares).
    pub volume: f64,
    #[serde(default)]
    pub trend: Trend,
    /// Unrecognised session names deserialize to `None` (no override).
    #[serde(default, deserialize_with = "lenient_time_of_day")]
    pub time_of_day: Option<TimeOfDay>,
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            volatility: 20.0,
            volume: 100_000_000.0,
            trend: Trend::Neutral,
            time_of_day: None,
        }
    }
}

impl fmt::Display for MarketConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vol={:.1} volume={:.0}M trend={} session={}",
            self.volatility,
            self.volume / 1_000_000.0,
            self.trend,
            self.time_of_day
                .map(|t| t.to_string())
                .unwrap_or_else(|| "none".into()),
        )
    }
}

fn lenient_time_of_day<'de, D>(deserializer: D) -> Result<Option<TimeOfDay>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

// ---------------------------------------------------------------------------
// Scan filters
// ---------------------------------------------------------------------------

/// Extra emphasis a time-of-day override asks the data source for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanFocus {
    Gaps,
    Momentum,
    News,
}

impl fmt::Display for ScanFocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFocus::Gaps => write!(f, "gaps"),
            ScanFocus::Momentum => write!(f, "momentum"),
            ScanFocus::News => write!(f, "news"),
        }
    }
}

/// Concrete parameters for one market scan.
///
/// Built by `AdaptiveFilterEngine` (or supplied by the caller), validated,
/// and not mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanFilters {
    pub exchange: String,
    pub min_volume: u64,
    pub min_price: f64,
    pub max_price: f64,
    pub min_daily_change_percent: f64,
    pub exclude_sectors: BTreeSet<String>,
    pub priority_sectors: Vec<String>,
    pub limit: usize,
    pub focus: Option<ScanFocus>,
}

/// Upper bound on `ScanFilters::limit`.
pub const MAX_SCAN_LIMIT: usize = 200;

impl Default for ScanFilters {
    fn default() -> Self {
        Self {
            exchange: "US".to_string(),
            min_volume: 1_000_000,
            min_price: 5.0,
            max_price: 500.0,
            min_daily_change_percent: 2.0,
            exclude_sectors: ["REIT", "ADR"].into_iter().map(String::from).collect(),
            priority_sectors: Vec::new(),
            limit: 30,
            focus: None,
        }
    }
}

impl ScanFilters {
    /// Reject malformed filters before any external call is made.
    pub fn validate(&self) -> Result<(), ThubError> {
        let finite = [self.min_price, self.max_price, self.min_daily_change_percent]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(ThubError::Validation("filters contain non-finite numbers".into()));
        }
        if self.exchange.trim().is_empty() {
            return Err(ThubError::Validation("exchange must not be empty".into()));
        }
        if self.min_price < 0.0 {
            return Err(ThubError::Validation(format!(
                "minPrice must be >= 0, got {}",
                self.min_price
            )));
        }
        if self.max_price <= self.min_price {
            return Err(ThubError::Validation(format!(
                "maxPrice ({}) must exceed minPrice ({})",
                self.max_price, self.min_price
            )));
        }
        if self.min_daily_change_percent < 0.0 {
            return Err(ThubError::Validation(
                "minDailyChangePercent must be >= 0".into(),
            ));
        }
        if self.limit == 0 || self.limit > MAX_SCAN_LIMIT {
            return Err(ThubError::Validation(format!(
                "limit must be in 1..={MAX_SCAN_LIMIT}, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    /// Whether a candidate satisfies the price/volume/change/sector filters.
    pub fn admits(&self, candidate: &MarketCandidate) -> bool {
        if candidate.volume < self.min_volume as f64 {
            return false;
        }
        if candidate.price < self.min_price || candidate.price > self.max_price {
            return false;
        }
        if candidate.change_percent.abs() < self.min_daily_change_percent {
            return false;
        }
        match &candidate.sector {
            Some(sector) => !self
                .exclude_sectors
                .iter()
                .any(|ex| ex.eq_ignore_ascii_case(sector)),
            None => true,
        }
    }

    /// Position of a sector in the priority list (lower is more important).
    pub fn priority_rank(&self, sector: Option<&str>) -> usize {
        sector
            .and_then(|s| {
                self.priority_sectors
                    .iter()
                    .position(|p| p.eq_ignore_ascii_case(s))
            })
            .unwrap_or(usize::MAX)
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// A symbol returned by the data source for a scan. Lives for one scan only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCandidate {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub change_percent: f64,
    pub dollar_volume: f64,
    /// Volume relative to the trailing average.
    pub volume_ratio: f64,
    #[serde(default)]
    pub sector: Option<String>,
    /// 0–100, filled in by the filter engine.
    #[serde(default)]
    pub opportunity_score: u32,
}

impl fmt::Display for MarketCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ${:.2} ({:+.2}%) vol={:.0} rvol={:.1}x score={}",
            self.symbol,
            self.price,
            self.change_percent,
            self.volume,
            self.volume_ratio,
            self.opportunity_score,
        )
    }
}

/// One page of raw candidates from the market-data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePage {
    pub candidates: Vec<MarketCandidate>,
    /// Size of the universe the source scanned to produce this page set.
    pub total_symbols: usize,
    #[serde(default)]
    pub next_page: Option<u32>,
}

// ---------------------------------------------------------------------------
// Layer scores & signals
// ---------------------------------------------------------------------------

/// Which independent scoring layer a score comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Technical,
    Sentiment,
    Liquidity,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Technical => write!(f, "technical"),
            Layer::Sentiment => write!(f, "sentiment"),
            Layer::Liquidity => write!(f, "liquidity"),
        }
    }
}

/// Direction of the underlying move, when the data source reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A single layer's reading for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerReading {
    pub score: f64,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// Three independently sourced 0–100 scores for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerScores {
    pub technical: f64,
    pub sentiment: f64,
    pub liquidity: f64,
}

impl LayerScores {
    /// All three scores must be finite and within 0–100.
    pub fn validate(&self) -> Result<(), String> {
        for (layer, v) in [
            (Layer::Technical, self.technical),
            (Layer::Sentiment, self.sentiment),
            (Layer::Liquidity, self.liquidity),
        ] {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(format!("{layer} score out of range: {v}"));
            }
        }
        Ok(())
    }
}

/// Discrete classification of a convergence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl SignalStrength {
    /// Mirror buy-side and sell-side classifications.
    pub fn flipped(self) -> Self {
        match self {
            SignalStrength::StrongBuy => SignalStrength::StrongSell,
            SignalStrength::Buy => SignalStrength::Sell,
            SignalStrength::Hold => SignalStrength::Hold,
            SignalStrength::Sell => SignalStrength::Buy,
            SignalStrength::StrongSell => SignalStrength::StrongBuy,
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalStrength::StrongBuy => "strong_buy",
            SignalStrength::Buy => "buy",
            SignalStrength::Hold => "hold",
            SignalStrength::Sell => "sell",
            SignalStrength::StrongSell => "strong_sell",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SignalStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "strong_buy" => Ok(SignalStrength::StrongBuy),
            "buy" => Ok(SignalStrength::Buy),
            "hold" => Ok(SignalStrength::Hold),
            "sell" => Ok(SignalStrength::Sell),
            "strong_sell" => Ok(SignalStrength::StrongSell),
            other => Err(format!("Unknown signal strength: {other}")),
        }
    }
}

/// Score at or above which a signal counts as "hot" on the dashboard.
pub const HOT_SIGNAL_SCORE: f64 = 70.0;

/// A converged, actionable signal for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub convergence_score: f64,
    pub signal_strength: SignalStrength,
    pub layer_scores: LayerScores,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Store-owned bookkeeping.
    #[serde(default)]
    pub viewed: bool,
    #[serde(default)]
    pub saved: bool,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({:.1}) [T:{:.0} S:{:.0} L:{:.0}]",
            self.symbol,
            self.signal_strength,
            self.convergence_score,
            self.layer_scores.technical,
            self.layer_scores.sentiment,
            self.layer_scores.liquidity,
        )
    }
}

impl Signal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_hot(&self) -> bool {
        self.convergence_score >= HOT_SIGNAL_SCORE
    }

    /// Hot, still active, and expiring within `window`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.is_hot() && !self.is_expired(now) && self.expires_at - now <= window
    }
}

// ---------------------------------------------------------------------------
// Analysis results
// ---------------------------------------------------------------------------

/// Cost and timing of one single-symbol analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    pub api_calls_used: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAnalysis {
    pub signal: Signal,
    pub metrics: AnalysisMetrics,
}

/// Outcome slot for one symbol of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolOutcome {
    pub symbol: String,
    pub signal: Option<Signal>,
    pub error: Option<String>,
}

impl SymbolOutcome {
    pub fn succeeded(&self) -> bool {
        self.signal.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total_symbols: usize,
    pub signals_created: usize,
    pub failed: usize,
    pub api_calls_used: u32,
    pub total_time_ms: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub results: Vec<SymbolOutcome>,
    pub summary: BatchSummary,
}

/// Output of one market scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketScanResult {
    pub scan_id: Uuid,
    pub total_symbols: usize,
    pub filtered_symbols: usize,
    pub candidates: Vec<MarketCandidate>,
    /// Top symbols handed on for full analysis.
    pub queued: Vec<String>,
    pub filters: ScanFilters,
    /// Conditions the candidates were scored against.
    pub conditions: MarketConditions,
    pub scan_time_ms: u64,
    /// The soft deadline cut the scan short.
    pub timed_out: bool,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Which quota window denied a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Minute,
    Daily,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Minute => write!(f, "minute"),
            QuotaWindow::Daily => write!(f, "daily"),
        }
    }
}

/// Domain-specific error types for THub.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThubError {
    #[error("API quota exceeded ({window} window), retry in {retry_after_ms}ms")]
    QuotaExceeded {
        retry_after_ms: u64,
        window: QuotaWindow,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Collaborator error ({source_name}): {message}")]
    Collaborator { source_name: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ThubError {
    pub fn collaborator(source_name: impl Into<String>, err: impl fmt::Display) -> Self {
        ThubError::Collaborator {
            source_name: source_name.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ThubError::QuotaExceeded { .. })
    }
}

pub type ThubResult<T> = Result<T, ThubError>;

/// Validate and normalise a ticker symbol (uppercase, 1–10 chars of
/// `A-Z0-9.-`).
pub fn normalize_symbol(raw: &str) -> ThubResult<String> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() || symbol.len() > 10 {
        return Err(ThubError::Validation(format!("invalid symbol length: {raw:?}")));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ThubError::Validation(format!("invalid symbol: {raw:?}")));
    }
    Ok(symbol)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
