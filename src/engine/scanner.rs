//! Candidate ranking and session timing for market scans.
//!
//! Raw pages from the data source go through the quality gate, then the
//! scan's own filters, are scored, deduplicated and sorted. The coordinator
//! owns paging and quota; everything here is synchronous and pure.

use chrono::{DateTime, Datelike, FixedOffset, Utc, Weekday};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use super::filters::AdaptiveFilterEngine;
use crate::types::{MarketCandidate, MarketConditions, ScanFilters, TimeOfDay};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// US Eastern standard offset. Daylight saving is not modelled.
const EASTERN_OFFSET_SECS: i32 = 5 * 3600;

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Result of ranking one scan's raw candidates.
#[derive(Debug, Clone, Default)]
pub struct RankedCandidates {
    /// Best first, truncated to the filter limit.
    pub candidates: Vec<MarketCandidate>,
    /// Survivors of gate and filters, before truncation.
    pub filtered: usize,
    /// Gate drops by reason.
    pub gate_rejections: BTreeMap<String, usize>,
    /// Passed the gate but failed the scan filters.
    pub filter_rejections: usize,
    pub duplicates: usize,
}

/// Gate, filter, score and sort `raw` candidates.
///
/// Ordering is opportunity score descending, then priority-sector rank,
/// then symbol, so equal inputs always rank identically.
pub fn rank_candidates(
    engine: &AdaptiveFilterEngine,
    filters: &ScanFilters,
    conditions: &MarketConditions,
    raw: Vec<MarketCandidate>,
) -> RankedCandidates {
    let mut ranked = RankedCandidates::default();
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(raw.len());

    for mut candidate in raw {
        if let Err(reason) = engine.quality_gate(&candidate) {
            debug!(symbol = %candidate.symbol, reason = %reason, "Candidate gated");
            *ranked.gate_rejections.entry(reason.to_string()).or_default() += 1;
            continue;
        }
        if !filters.admits(&candidate) {
            ranked.filter_rejections += 1;
            continue;
        }
        // Only admitted rows claim the symbol; a bad copy must not shadow a good one.
        if !seen.insert(candidate.symbol.clone()) {
            ranked.duplicates += 1;
            continue;
        }
        candidate.opportunity_score = engine.opportunity_score(&candidate, conditions);
        kept.push(candidate);
    }

    kept.sort_by(|a, b| {
        b.opportunity_score
            .cmp(&a.opportunity_score)
            .then_with(|| {
                filters
                    .priority_rank(a.sector.as_deref())
                    .cmp(&filters.priority_rank(b.sector.as_deref()))
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    ranked.filtered = kept.len();
    kept.truncate(filters.limit);
    ranked.candidates = kept;

    let gated: usize = ranked.gate_rejections.values().sum();
    info!(
        kept = ranked.candidates.len(),
        filtered = ranked.filtered,
        gated,
        filter_rejections = ranked.filter_rejections,
        "Candidates ranked"
    );

    ranked
}

// ---------------------------------------------------------------------------
// Session timing
// ---------------------------------------------------------------------------

/// Trading session at `now`, or None outside trading hours and on weekends.
pub fn eastern_session(now: DateTime<Utc>) -> Option<TimeOfDay> {
    let offset = FixedOffset::west_opt(EASTERN_OFFSET_SECS)?;
    let local = now.with_timezone(&offset);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return None;
    }
    TimeOfDay::from_eastern_time(local.time())
}

/// Whether the scheduled scanner should run at `now`.
pub fn in_regular_session(now: DateTime<Utc>) -> bool {
    eastern_session(now).is_some_and(|s| s.is_regular_session())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trend;
    use chrono::TimeZone;

    fn candidate(symbol: &str, price: f64, volume: f64, change: f64, rvol: f64) -> MarketCandidate {
        MarketCandidate {
            symbol: symbol.into(),
            price,
            volume,
            change_percent: change,
            dollar_volume: price * volume,
            volume_ratio: rvol,
            sector: None,
            opportunity_score: 0,
        }
    }

    fn neutral() -> MarketConditions {
        MarketConditions {
            volatility: 20.0,
            volume: 100_000_000.0,
            trend: Trend::Neutral,
            time_of_day: None,
        }
    }

    #[test]
    fn test_gate_violators_never_ranked() {
        let engine = AdaptiveFilterEngine::new();
        let raw = vec![
            candidate("GOOD", 50.0, 3_000_000.0, 4.0, 2.0),
            candidate("ANOM", 50.0, 3_000_000.0, 150.0, 2.0),
            candidate("PENNY", 0.5, 3_000_000.0, 4.0, 2.0),
            candidate("SPIKE", 50.0, 3_000_000.0, 4.0, 80.0),
        ];
        let ranked = rank_candidates(&engine, &ScanFilters::default(), &neutral(), raw);
        let symbols: Vec<&str> = ranked.candidates.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["GOOD"]);
        assert_eq!(ranked.gate_rejections.values().sum::<usize>(), 3);
        assert_eq!(ranked.gate_rejections.get("data_anomaly"), Some(&1));
    }

    #[test]
    fn test_filters_applied_after_gate() {
        let engine = AdaptiveFilterEngine::new();
        let mut reit = candidate("REIT1", 50.0, 3_000_000.0, 4.0, 2.0);
        reit.sector = Some("REIT".into());
        let raw = vec![
            candidate("OK", 50.0, 3_000_000.0, 4.0, 2.0),
            candidate("PRICEY", 900.0, 3_000_000.0, 4.0, 2.0),
            candidate("QUIET", 50.0, 3_000_000.0, 0.5, 2.0),
            reit,
        ];
        let ranked = rank_candidates(&engine, &ScanFilters::default(), &neutral(), raw);
        assert_eq!(ranked.filtered, 1);
        assert_eq!(ranked.filter_rejections, 3);
    }

    #[test]
    fn test_sorted_desc_and_truncated() {
        let engine = AdaptiveFilterEngine::new();
        let filters = ScanFilters {
            limit: 2,
            ..Default::default()
        };
        let raw = vec![
            candidate("LOW", 10.0, 1_500_000.0, 2.5, 1.0),
            candidate("HIGH", 100.0, 5_000_000.0, 9.0, 4.0),
            candidate("MID", 50.0, 2_000_000.0, 5.0, 2.0),
        ];
        let ranked = rank_candidates(&engine, &filters, &neutral(), raw);
        assert_eq!(ranked.filtered, 3);
        let symbols: Vec<&str> = ranked.candidates.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["HIGH", "MID"]);
        assert!(ranked.candidates[0].opportunity_score >= ranked.candidates[1].opportunity_score);
    }

    #[test]
    fn test_ties_break_on_priority_then_symbol() {
        let engine = AdaptiveFilterEngine::new();
        let filters = ScanFilters {
            priority_sectors: vec!["Utilities".into(), "Technology".into()],
            ..Default::default()
        };
        let mut a = candidate("AAA", 50.0, 2_000_000.0, 5.0, 2.0);
        a.sector = Some("Technology".into());
        let mut b = candidate("BBB", 50.0, 2_000_000.0, 5.0, 2.0);
        b.sector = Some("Utilities".into());
        let c = candidate("CCC", 50.0, 2_000_000.0, 5.0, 2.0);
        let d = candidate("ABC", 50.0, 2_000_000.0, 5.0, 2.0);

        let ranked = rank_candidates(&engine, &filters, &neutral(), vec![c, a, d, b]);
        let symbols: Vec<&str> = ranked.candidates.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBB", "AAA", "ABC", "CCC"]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let engine = AdaptiveFilterEngine::new();
        let raw = vec![
            candidate("DUP", 50.0, 2_000_000.0, 5.0, 2.0),
            candidate("DUP", 60.0, 2_000_000.0, 5.0, 2.0),
        ];
        let ranked = rank_candidates(&engine, &ScanFilters::default(), &neutral(), raw);
        assert_eq!(ranked.candidates.len(), 1);
        assert_eq!(ranked.duplicates, 1);
        assert_eq!(ranked.candidates[0].price, 50.0);
    }

    #[test]
    fn test_gated_copy_does_not_hide_valid_duplicate() {
        let engine = AdaptiveFilterEngine::new();
        let raw = vec![
            candidate("DUP", 50.0, 2_000_000.0, 150.0, 2.0),
            candidate("DUP", 60.0, 2_000_000.0, 5.0, 2.0),
        ];
        let ranked = rank_candidates(&engine, &ScanFilters::default(), &neutral(), raw);
        assert_eq!(ranked.candidates.len(), 1);
        assert_eq!(ranked.candidates[0].price, 60.0);
        assert_eq!(ranked.duplicates, 0);
        assert_eq!(ranked.gate_rejections.values().sum::<usize>(), 1);
    }

    #[test]
    fn test_eastern_session_mapping() {
        // Wednesday 2025-01-15; 15:00 UTC is 10:00 EST.
        let at = |h, m| Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap();
        assert_eq!(eastern_session(at(12, 0)), Some(TimeOfDay::PreMarket));
        assert_eq!(eastern_session(at(14, 45)), Some(TimeOfDay::OpeningBell));
        assert_eq!(eastern_session(at(17, 0)), Some(TimeOfDay::Midday));
        assert_eq!(eastern_session(at(20, 30)), Some(TimeOfDay::PowerHour));
        assert_eq!(eastern_session(at(22, 0)), Some(TimeOfDay::AfterHours));
        assert_eq!(eastern_session(at(3, 0)), None);

        assert!(in_regular_session(at(17, 0)));
        assert!(!in_regular_session(at(12, 0)));
    }

    #[test]
    fn test_weekend_has_no_session() {
        // Saturday noon EST.
        let sat = Utc.with_ymd_and_hms(2025, 1, 18, 17, 0, 0).unwrap();
        assert_eq!(eastern_session(sat), None);
        assert!(!in_regular_session(sat));
    }
}
