//! Analysis coordinator.
//!
//! Entry point for single-symbol analysis, batch analysis, market scans,
//! and the read-side queries behind the dashboard. Every call that reaches
//! the upstream data source is first authorised by the shared
//! `QuotaGovernor`; read queries go through the `ResultCache` instead.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filters::AdaptiveFilterEngine;
use super::scanner::rank_candidates;
use crate::cache::{Cached, ResultCache};
use crate::config::AppConfig;
use crate::data::{LayerScorer, MarketDataProvider};
use crate::quota::{ApiUsage, QuotaGovernor};
use crate::storage::{SignalQuery, SignalStore};
use crate::strategy::ConvergenceAnalyzer;
use crate::types::{
    normalize_symbol, AnalysisMetrics, BatchResult, BatchSummary, Direction, LayerScores,
    MarketCandidate, MarketConditions, MarketScanResult, ScanFilters, Signal, StockAnalysis,
    SymbolOutcome, ThubError, ThubResult,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Most symbols one batch may carry.
pub const MAX_BATCH_SYMBOLS: usize = 50;

/// Signals listed in the overview.
const OVERVIEW_TOP_SIGNALS: usize = 5;

const MARKET_SOURCE: &str = "market_data";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Symbols analysed concurrently within one batch.
    pub batch_concurrency: usize,
    /// Hard wall-clock budget for a scan.
    pub scan_budget: Duration,
    /// After this, a scan stops paging and returns what it has.
    pub soft_deadline: Duration,
    pub max_pages: u32,
    /// Top scan candidates queued for analysis.
    pub auto_queue_top: usize,
    /// Hot signals expiring within this window get refreshed.
    pub refresh_window: chrono::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 4,
            scan_budget: Duration::from_secs(240),
            soft_deadline: Duration::from_secs(210),
            max_pages: 10,
            auto_queue_top: 10,
            refresh_window: chrono::Duration::minutes(60),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            batch_concurrency: cfg.analysis.batch_concurrency.max(1),
            scan_budget: Duration::from_secs(cfg.scanner.budget_secs),
            soft_deadline: Duration::from_secs(cfg.scanner.soft_deadline_secs),
            max_pages: cfg.scanner.max_pages.max(1),
            auto_queue_top: cfg.scanner.auto_queue_top,
            refresh_window: chrono::Duration::minutes(cfg.analysis.refresh_window_mins),
        }
    }
}

/// External services the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketDataProvider>,
    pub technical: Arc<dyn LayerScorer>,
    pub sentiment: Arc<dyn LayerScorer>,
    pub liquidity: Arc<dyn LayerScorer>,
    pub store: Arc<dyn SignalStore>,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Aggregate view over stored signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOverview {
    pub total_signals: usize,
    pub active_signals: usize,
    pub hot_signals: usize,
    /// Active signals per strength label.
    pub by_strength: BTreeMap<String, usize>,
    /// Mean convergence score of active signals.
    pub average_score: f64,
    pub top_signals: Vec<Signal>,
    pub generated_at: chrono::DateTime<Utc>,
}

/// A scan followed by analysis of its queued symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAndAnalyze {
    pub scan: MarketScanResult,
    pub analysis: Option<BatchResult>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct AnalysisCoordinator {
    governor: Arc<QuotaGovernor>,
    filter_engine: AdaptiveFilterEngine,
    analyzer: ConvergenceAnalyzer,
    services: Collaborators,
    cache: Arc<ResultCache>,
    /// Bumped whenever a signal's view/save flags change, so cached reads
    /// taken before the change are no longer addressed.
    read_epoch: AtomicU64,
    config: CoordinatorConfig,
}

impl AnalysisCoordinator {
    pub fn new(
        governor: Arc<QuotaGovernor>,
        services: Collaborators,
        cache: Arc<ResultCache>,
        analyzer: ConvergenceAnalyzer,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            governor,
            filter_engine: AdaptiveFilterEngine::new(),
            analyzer,
            services,
            cache,
            read_epoch: AtomicU64::new(0),
            config,
        }
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.governor
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Upstream calls one full analysis costs.
    pub fn calls_per_analysis(&self) -> u32 {
        self.services.technical.api_calls()
            + self.services.sentiment.api_calls()
            + self.services.liquidity.api_calls()
    }

    // -- Single symbol ---------------------------------------------------

    /// Score one symbol on all three layers and emit a signal.
    ///
    /// The full call cost is consumed up front. A quota denial returns
    /// before any collaborator is touched and no signal is produced.
    pub async fn analyze_stock(&self, symbol: &str) -> ThubResult<StockAnalysis> {
        let symbol = normalize_symbol(symbol)?;
        let started = Instant::now();
        let calls = self.calls_per_analysis();

        if let Err(e) = self.governor.consume(calls) {
            warn!(symbol = %symbol, calls, error = %e, "Analysis denied by quota");
            return Err(e);
        }

        let (technical, sentiment, liquidity) = tokio::join!(
            self.services.technical.score(&symbol),
            self.services.sentiment.score(&symbol),
            self.services.liquidity.score(&symbol),
        );
        let technical = technical.map_err(|e| ThubError::collaborator("technical", e))?;
        let sentiment = sentiment.map_err(|e| ThubError::collaborator("sentiment", e))?;
        let liquidity = liquidity.map_err(|e| ThubError::collaborator("liquidity", e))?;

        let scores = LayerScores {
            technical: technical.score,
            sentiment: sentiment.score,
            liquidity: liquidity.score,
        };
        scores
            .validate()
            .map_err(|msg| ThubError::collaborator("layer_scores", msg))?;

        // Price direction comes from the technical layer when it reports one.
        let direction: Option<Direction> = technical
            .direction
            .or(sentiment.direction)
            .or(liquidity.direction);

        let signal = self
            .analyzer
            .build_signal(&symbol, scores, direction, Utc::now());
        let signal = self
            .services
            .store
            .create_signal(signal)
            .await
            .map_err(|e| ThubError::Storage(format!("{e:#}")))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(signal = %signal, calls, elapsed_ms, "Signal created");

        Ok(StockAnalysis {
            signal,
            metrics: AnalysisMetrics {
                api_calls_used: calls,
                elapsed_ms,
            },
        })
    }

    /// Quota spent by a failed analysis. Calls consumed before a
    /// collaborator or store failure still count.
    fn charged_calls(&self, err: &ThubError) -> u32 {
        match err {
            ThubError::Collaborator { .. } | ThubError::Storage(_) => self.calls_per_analysis(),
            _ => 0,
        }
    }

    // -- Batch -----------------------------------------------------------

    /// Analyse many symbols on a bounded worker pool sharing the governor.
    ///
    /// Each symbol gets its own result slot; one failure never aborts the
    /// batch. Before each launch the coordinator sleeps for the governor's
    /// pacing delay. Setting `cancel` to true stops new launches; in-flight
    /// work still finishes and is recorded.
    pub async fn analyze_batch(
        self: &Arc<Self>,
        symbols: Vec<String>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ThubResult<BatchResult> {
        if symbols.is_empty() {
            return Err(ThubError::Validation("symbols must not be empty".into()));
        }
        if symbols.len() > MAX_BATCH_SYMBOLS {
            return Err(ThubError::Validation(format!(
                "at most {MAX_BATCH_SYMBOLS} symbols per batch, got {}",
                symbols.len()
            )));
        }

        let started = Instant::now();
        let total = symbols.len();
        info!(
            symbols = total,
            concurrency = self.config.batch_concurrency,
            "Batch analysis started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        let mut tasks: JoinSet<(usize, ThubResult<StockAnalysis>)> = JoinSet::new();
        let mut launched = vec![false; total];
        let mut cancelled = false;

        for (idx, symbol) in symbols.iter().enumerate() {
            if is_cancelled(&cancel) {
                cancelled = true;
                break;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let delay = self.governor.optimal_delay();
            if !delay.is_zero() {
                debug!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "Pacing");
                tokio::time::sleep(delay).await;
            }

            if is_cancelled(&cancel) {
                cancelled = true;
                break;
            }

            launched[idx] = true;
            let this = Arc::clone(self);
            let symbol = symbol.clone();
            tasks.spawn(async move {
                let outcome = this.analyze_stock(&symbol).await;
                drop(permit);
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<(SymbolOutcome, u32)>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(analysis))) => {
                    let calls = analysis.metrics.api_calls_used;
                    slots[idx] = Some((
                        SymbolOutcome {
                            symbol: symbols[idx].clone(),
                            signal: Some(analysis.signal),
                            error: None,
                        },
                        calls,
                    ));
                }
                Ok((idx, Err(e))) => {
                    warn!(symbol = %symbols[idx], error = %e, "Symbol analysis failed");
                    slots[idx] = Some((
                        SymbolOutcome {
                            symbol: symbols[idx].clone(),
                            signal: None,
                            error: Some(e.to_string()),
                        },
                        self.charged_calls(&e),
                    ));
                }
                Err(e) => warn!(error = %e, "Analysis task failed"),
            }
        }

        let mut results = Vec::with_capacity(total);
        let mut api_calls_used = 0u32;
        for (idx, slot) in slots.into_iter().enumerate() {
            let outcome = match slot {
                Some((outcome, calls)) => {
                    api_calls_used += calls;
                    outcome
                }
                None => SymbolOutcome {
                    symbol: symbols[idx].clone(),
                    signal: None,
                    error: Some(if launched[idx] {
                        "analysis task failed".into()
                    } else {
                        "cancelled".into()
                    }),
                },
            };
            results.push(outcome);
        }

        let signals_created = results.iter().filter(|r| r.succeeded()).count();
        let summary = BatchSummary {
            total_symbols: total,
            signals_created,
            failed: total - signals_created,
            api_calls_used,
            total_time_ms: started.elapsed().as_millis() as u64,
            cancelled,
        };

        info!(
            total = summary.total_symbols,
            created = summary.signals_created,
            failed = summary.failed,
            api_calls = summary.api_calls_used,
            elapsed_ms = summary.total_time_ms,
            cancelled,
            "Batch analysis complete"
        );

        Ok(BatchResult { results, summary })
    }

    // -- Market scan -----------------------------------------------------

    /// Discover candidates under the current (or supplied) filters.
    ///
    /// Pages are requested until the source runs out, `max_pages` is hit,
    /// or the soft deadline passes; later pages that fail or are denied by
    /// quota end the scan with what was collected. Only a failure on the
    /// first page is an error.
    pub async fn scan_market(&self, filters: Option<ScanFilters>) -> ThubResult<MarketScanResult> {
        let started = Instant::now();
        let scan_id = Uuid::new_v4();

        // Caller filters replace the adaptive ones, but ranking still
        // scores against live conditions.
        let (filters, conditions) = match filters {
            Some(filters) => {
                filters.validate()?;
                let conditions = self.current_conditions().await?;
                (filters, conditions)
            }
            None => {
                let conditions = self.current_conditions().await?;
                let filters = self.filter_engine.adaptive_filters(&conditions);
                filters.validate()?;
                (filters, conditions)
            }
        };

        info!(scan_id = %scan_id, limit = filters.limit, "Market scan started");

        let hard_deadline = started + self.config.scan_budget;
        let soft_deadline = started + self.config.soft_deadline;
        let mut raw: Vec<MarketCandidate> = Vec::new();
        let mut total_symbols = 0usize;
        let mut timed_out = false;
        let mut next_page = Some(0u32);

        while let Some(page) = next_page.take() {
            if page >= self.config.max_pages {
                break;
            }

            let now = Instant::now();
            let deadline = if page == 0 { hard_deadline } else { soft_deadline };
            if now >= deadline {
                timed_out = true;
                break;
            }

            if page > 0 {
                let delay = self.governor.optimal_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay.min(deadline - now)).await;
                }
            }

            if let Err(e) = self.governor.consume(1) {
                if page == 0 {
                    warn!(scan_id = %scan_id, error = %e, "Scan denied by quota");
                    return Err(e);
                }
                warn!(
                    scan_id = %scan_id,
                    page,
                    "Quota exhausted mid-scan, returning partial results"
                );
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let fetched = tokio::time::timeout(
                remaining,
                self.services.market.fetch_candidates(&filters, page),
            )
            .await;

            match fetched {
                Err(_) => {
                    warn!(
                        scan_id = %scan_id,
                        page,
                        "Scan deadline reached, returning partial results"
                    );
                    timed_out = true;
                }
                Ok(Err(e)) if page == 0 => {
                    return Err(ThubError::collaborator(MARKET_SOURCE, e));
                }
                Ok(Err(e)) => {
                    warn!(
                        scan_id = %scan_id,
                        page,
                        error = %e,
                        "Candidate page failed, returning partial results"
                    );
                }
                Ok(Ok(batch)) => {
                    debug!(page, candidates = batch.candidates.len(), "Candidate page received");
                    total_symbols = total_symbols.max(batch.total_symbols);
                    raw.extend(batch.candidates);
                    next_page = match batch.next_page {
                        Some(next) if next <= page => {
                            warn!(
                                scan_id = %scan_id,
                                page,
                                next,
                                "Source repeated a page, stopping"
                            );
                            None
                        }
                        other => other,
                    };
                }
            }
        }

        total_symbols = total_symbols.max(raw.len());
        let ranked = rank_candidates(&self.filter_engine, &filters, &conditions, raw);
        let queued = ranked
            .candidates
            .iter()
            .take(self.config.auto_queue_top)
            .map(|c| c.symbol.clone())
            .collect();

        let result = MarketScanResult {
            scan_id,
            total_symbols,
            filtered_symbols: ranked.filtered,
            candidates: ranked.candidates,
            queued,
            filters,
            conditions,
            scan_time_ms: started.elapsed().as_millis() as u64,
            timed_out,
        };

        info!(
            scan_id = %scan_id,
            total = result.total_symbols,
            filtered = result.filtered_symbols,
            returned = result.candidates.len(),
            timed_out,
            elapsed_ms = result.scan_time_ms,
            "Market scan complete"
        );

        Ok(result)
    }

    /// Live conditions. A collaborator failure degrades to neutral
    /// defaults; a quota denial is returned.
    async fn current_conditions(&self) -> ThubResult<MarketConditions> {
        self.governor.consume(1)?;
        match self.services.market.market_conditions().await {
            Ok(conditions) => Ok(conditions),
            Err(e) => {
                warn!(error = %e, "Market conditions unavailable, using defaults");
                Ok(MarketConditions::default())
            }
        }
    }

    /// Scan, then analyse the queued symbols as one batch.
    pub async fn scan_and_analyze(
        self: &Arc<Self>,
        filters: Option<ScanFilters>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ThubResult<ScanAndAnalyze> {
        let scan = self.scan_market(filters).await?;
        let analysis = if scan.queued.is_empty() {
            None
        } else {
            Some(self.analyze_batch(scan.queued.clone(), cancel).await?)
        };
        Ok(ScanAndAnalyze { scan, analysis })
    }

    // -- Signal monitor --------------------------------------------------

    /// Re-analyse hot signals that are about to expire. Returns None when
    /// nothing needs refreshing.
    pub async fn refresh_hot_signals(
        self: &Arc<Self>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ThubResult<Option<BatchResult>> {
        let now = Utc::now();
        let hot = self
            .services
            .store
            .query(&SignalQuery::hot())
            .await
            .map_err(|e| ThubError::Storage(format!("{e:#}")))?;

        let symbols: Vec<String> = hot
            .into_iter()
            .filter(|s| s.needs_refresh(now, self.config.refresh_window))
            .take(MAX_BATCH_SYMBOLS)
            .map(|s| s.symbol)
            .collect();

        if symbols.is_empty() {
            debug!("No hot signals need refreshing");
            return Ok(None);
        }

        info!(count = symbols.len(), "Refreshing hot signals");
        self.analyze_batch(symbols, cancel).await.map(Some)
    }

    // -- Read side -------------------------------------------------------

    /// Aggregate over stored signals. Cached; never quota gated.
    pub async fn market_overview(&self) -> ThubResult<Cached<MarketOverview>> {
        let key = ResultCache::key(&self.read_scope("overview"), &"all");
        self.cache
            .get_or_compute(&key, None, || async {
                let signals = self
                    .services
                    .store
                    .query(&SignalQuery::all())
                    .await
                    .map_err(|e| ThubError::Storage(format!("{e:#}")))?;
                Ok(build_overview(&signals, Utc::now()))
            })
            .await
    }

    /// Signals matching `query`. Cached per distinct query.
    pub async fn signals(&self, query: &SignalQuery) -> ThubResult<Cached<Vec<Signal>>> {
        let key = ResultCache::key(&self.read_scope("signals"), query);
        self.cache
            .get_or_compute(&key, None, || async {
                self.services
                    .store
                    .query(query)
                    .await
                    .map_err(|e| ThubError::Storage(format!("{e:#}")))
            })
            .await
    }

    pub async fn mark_viewed(&self, id: Uuid) -> ThubResult<bool> {
        let found = self
            .services
            .store
            .mark_viewed(id)
            .await
            .map_err(|e| ThubError::Storage(format!("{e:#}")))?;
        if found {
            self.invalidate_reads();
        }
        Ok(found)
    }

    pub async fn toggle_saved(&self, id: Uuid) -> ThubResult<Option<bool>> {
        let saved = self
            .services
            .store
            .toggle_saved(id)
            .await
            .map_err(|e| ThubError::Storage(format!("{e:#}")))?;
        if saved.is_some() {
            self.invalidate_reads();
        }
        Ok(saved)
    }

    /// Cache scope for read queries at the current epoch.
    fn read_scope(&self, scope: &str) -> String {
        format!("{scope}@{}", self.read_epoch.load(Ordering::Acquire))
    }

    fn invalidate_reads(&self) {
        let epoch = self.read_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "Cached signal reads invalidated");
    }

    /// Governor telemetry.
    pub fn api_usage(&self) -> ApiUsage {
        self.governor.usage()
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

fn build_overview(signals: &[Signal], now: chrono::DateTime<Utc>) -> MarketOverview {
    let active: Vec<&Signal> = signals.iter().filter(|s| !s.is_expired(now)).collect();

    let mut by_strength = BTreeMap::new();
    for s in &active {
        *by_strength.entry(s.signal_strength.to_string()).or_insert(0) += 1;
    }

    let average_score = if active.is_empty() {
        0.0
    } else {
        let mean = active.iter().map(|s| s.convergence_score).sum::<f64>() / active.len() as f64;
        (mean * 10.0).round() / 10.0
    };

    let mut top: Vec<Signal> = active.iter().map(|s| (*s).clone()).collect();
    top.sort_by(|a, b| b.convergence_score.total_cmp(&a.convergence_score));
    top.truncate(OVERVIEW_TOP_SIGNALS);

    MarketOverview {
        total_signals: signals.len(),
        active_signals: active.len(),
        hot_signals: active.iter().filter(|s| s.is_hot()).count(),
        by_strength,
        average_score,
        top_signals: top,
        generated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
