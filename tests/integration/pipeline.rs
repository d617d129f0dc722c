//! End-to-end runs of the scan and analysis pipeline.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

use thub::cache::ResultCache;
use thub::engine::{AnalysisCoordinator, Collaborators, CoordinatorConfig};
use thub::quota::{QuotaConfig, QuotaGovernor};
use thub::storage::{self, InMemorySignalStore, SignalQuery};
use thub::strategy::ConvergenceAnalyzer;
use thub::types::*;
use thub::webhook::{build_router, ServerState};

use crate::mock_market::MockMarket;
use crate::mock_market::MockScorer;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    coordinator: Arc<AnalysisCoordinator>,
    market: Arc<MockMarket>,
    technical: Arc<MockScorer>,
    store: Arc<InMemorySignalStore>,
}

fn harness(
    quota: QuotaConfig,
    conditions: MarketConditions,
    technical: MockScorer,
    config: CoordinatorConfig,
) -> Harness {
    let market = Arc::new(MockMarket::new(conditions, MockMarket::default_candidates()));
    let technical = Arc::new(technical);
    let store = Arc::new(InMemorySignalStore::new());

    let coordinator = Arc::new(AnalysisCoordinator::new(
        Arc::new(QuotaGovernor::new(quota)),
        Collaborators {
            market: market.clone(),
            technical: technical.clone(),
            sentiment: Arc::new(MockScorer::new(Layer::Sentiment, 75.0)),
            liquidity: Arc::new(MockScorer::new(Layer::Liquidity, 70.0)),
            store: store.clone(),
        },
        Arc::new(ResultCache::in_memory()),
        ConvergenceAnalyzer::default(),
        config,
    ));

    Harness {
        coordinator,
        market,
        technical,
        store,
    }
}

fn default_harness() -> Harness {
    harness(
        QuotaConfig::default(),
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0),
        CoordinatorConfig::default(),
    )
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Batch analysis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_isolates_failing_symbol() {
    let h = harness(
        QuotaConfig::default(),
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0).failing_on("B"),
        CoordinatorConfig::default(),
    );

    let batch = h
        .coordinator
        .analyze_batch(symbols(&["A", "B", "C"]), None)
        .await
        .unwrap();

    assert_eq!(batch.results.len(), 3);
    assert_eq!(batch.summary.signals_created, 2);
    assert_eq!(batch.summary.failed, 1);

    let order: Vec<&str> = batch.results.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
    assert!(batch.results[0].succeeded());
    assert!(batch.results[1].error.as_deref().unwrap().contains("technical"));
    assert!(batch.results[2].succeeded());

    // The failed symbol still spent its calls upstream.
    assert_eq!(batch.summary.api_calls_used, 9);
    assert_eq!(h.coordinator.governor().stats().minute.used, 9);

    let stored: Vec<String> = h
        .store
        .snapshot()
        .await
        .into_iter()
        .map(|s| s.symbol)
        .collect();
    assert_eq!(stored.len(), 2);
    assert!(stored.contains(&"A".to_string()));
    assert!(stored.contains(&"C".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_batch_never_exceeds_buffered_cap() {
    // Hard cap 10, buffered cap floor(10 * 0.95) = 9: three analyses fit.
    let quota = QuotaConfig {
        minute_limit: 10,
        ..QuotaConfig::default()
    };
    let h = harness(
        quota,
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0),
        CoordinatorConfig::default(),
    );

    let batch = h
        .coordinator
        .analyze_batch(symbols(&["A", "B", "C", "D", "E"]), None)
        .await
        .unwrap();

    assert_eq!(batch.summary.signals_created, 3);
    let denied = batch
        .results
        .iter()
        .filter(|r| r.error.as_deref().is_some_and(|e| e.contains("quota")))
        .count();
    assert_eq!(denied, 2);

    let stats = h.coordinator.governor().stats();
    assert_eq!(stats.minute.used, 9);
    assert_eq!(stats.minute.remaining, 0);
    // Denied symbols never reached a scorer.
    assert_eq!(h.technical.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_minute_window_recovers_after_rollover() {
    let quota = QuotaConfig {
        minute_limit: 10,
        ..QuotaConfig::default()
    };
    let h = harness(
        quota,
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0),
        CoordinatorConfig::default(),
    );

    for symbol in ["A", "B", "C"] {
        h.coordinator.analyze_stock(symbol).await.unwrap();
    }
    let err = h.coordinator.analyze_stock("D").await.unwrap_err();
    match err {
        ThubError::QuotaExceeded {
            window,
            retry_after_ms,
        } => {
            assert_eq!(window, QuotaWindow::Minute);
            assert!(retry_after_ms <= 60_000);
        }
        other => panic!("expected quota error, got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(61)).await;

    let analysis = h.coordinator.analyze_stock("D").await.unwrap();
    assert_eq!(analysis.signal.symbol, "D");
    assert_eq!(h.coordinator.governor().stats().minute.used, 3);
}

#[tokio::test]
async fn test_warning_flag_tracks_hard_cap_percentage() {
    let quota = QuotaConfig {
        minute_limit: 100,
        ..QuotaConfig::default()
    };
    let h = harness(
        quota,
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0),
        CoordinatorConfig::default(),
    );
    let governor = h.coordinator.governor();

    governor.consume(79).unwrap();
    assert!(!governor.is_approaching_limit());

    governor.consume(2).unwrap();
    assert!(governor.is_approaching_limit());
    assert!(h.coordinator.api_usage().approaching_limit);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_new_launches() {
    let config = CoordinatorConfig {
        batch_concurrency: 1,
        ..CoordinatorConfig::default()
    };
    let h = harness(
        QuotaConfig::default(),
        MarketConditions::default(),
        MockScorer::new(Layer::Technical, 85.0).with_latency(Duration::from_secs(1)),
        config,
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let _ = tx.send(true);
    });

    let batch = h
        .coordinator
        .analyze_batch(symbols(&["A", "B", "C", "D", "E"]), Some(rx))
        .await
        .unwrap();

    assert!(batch.summary.cancelled);
    assert_eq!(batch.results.len(), 5);

    let created = batch.summary.signals_created;
    assert!(created >= 1 && created < 5);
    let cancelled = batch
        .results
        .iter()
        .filter(|r| r.error.as_deref() == Some("cancelled"))
        .count();
    assert_eq!(cancelled, 5 - created);
    // In-flight work finished and was stored.
    assert_eq!(h.store.len().await, created);
}

// ---------------------------------------------------------------------------
// Market scan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_excludes_gate_violators() {
    let h = default_harness();

    let scan = h.coordinator.scan_market(None).await.unwrap();

    let found: Vec<&str> = scan.candidates.iter().map(|c| c.symbol.as_str()).collect();
    for bad in ["BADDATA", "PENNY", "THIN", "PUMP"] {
        assert!(!found.contains(&bad), "{bad} slipped through the gate");
    }
    // REIT is excluded, SLOW moved too little.
    assert!(!found.contains(&"O"));
    assert!(!found.contains(&"SLOW"));
    assert_eq!(found.len(), 3);
    assert!(["NVDA", "AMD", "XOM"].iter().all(|s| found.contains(s)));

    for pair in scan.candidates.windows(2) {
        assert!(pair[0].opportunity_score >= pair[1].opportunity_score);
    }
    assert_eq!(scan.total_symbols, 9);
    assert_eq!(scan.conditions, MarketConditions::default());
    assert!(!scan.timed_out);

    // Conditions plus three pages of three.
    assert_eq!(h.market.candidate_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.coordinator.governor().stats().minute.used, 4);
}

#[tokio::test]
async fn test_premarket_scan_uses_session_override() {
    let conditions = MarketConditions {
        time_of_day: Some(TimeOfDay::PreMarket),
        ..MarketConditions::default()
    };
    let h = harness(
        QuotaConfig::default(),
        conditions,
        MockScorer::new(Layer::Technical, 85.0),
        CoordinatorConfig::default(),
    );

    let scan = h.coordinator.scan_market(None).await.unwrap();

    assert_eq!(scan.filters.min_daily_change_percent, 5.0);
    assert_eq!(scan.filters.min_volume, 500_000);
    assert_eq!(scan.filters.limit, 20);
    assert_eq!(scan.filters.focus, Some(ScanFocus::Gaps));

    // Only NVDA gapped more than 5%.
    let found: Vec<&str> = scan.candidates.iter().map(|c| c.symbol.as_str()).collect();
    assert_eq!(found, vec!["NVDA"]);
}

#[tokio::test]
async fn test_scan_fails_when_market_data_down() {
    let h = default_harness();
    h.market.set_error("connection refused");

    let err = h.coordinator.scan_market(None).await.unwrap_err();
    assert!(matches!(err, ThubError::Collaborator { .. }));
}

#[tokio::test]
async fn test_scan_and_analyze_stores_queued_signals() {
    let h = default_harness();

    let out = h.coordinator.scan_and_analyze(None, None).await.unwrap();

    assert_eq!(out.scan.queued.len(), 3);
    let analysis = out.analysis.expect("queued symbols analysed");
    assert_eq!(analysis.summary.signals_created, 3);

    let hot = h
        .coordinator
        .signals(&SignalQuery::hot())
        .await
        .unwrap()
        .value;
    assert_eq!(hot.len(), 3);
    for pair in hot.windows(2) {
        assert!(pair[0].convergence_score >= pair[1].convergence_score);
    }

    let overview = h.coordinator.market_overview().await.unwrap().value;
    assert_eq!(overview.total_signals, 3);
    assert_eq!(overview.hot_signals, 3);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_signals_survive_snapshot_restart() {
    let h = default_harness();
    h.coordinator
        .analyze_batch(symbols(&["NVDA", "AMD"]), None)
        .await
        .unwrap();

    let path = std::env::temp_dir()
        .join(format!("thub_pipeline_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();

    storage::save_snapshot(&h.store.snapshot().await, &path).unwrap();
    let restored = storage::load_snapshot(&path).unwrap().unwrap();
    storage::delete_snapshot(&path).unwrap();

    let store = InMemorySignalStore::from_signals(restored);
    assert_eq!(store.len().await, 2);
    assert_eq!(store.snapshot().await, h.store.snapshot().await);
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_webhook_scan_then_read_signals() {
    let h = default_harness();
    let app = build_router(Arc::new(ServerState::new(h.coordinator.clone())));

    let resp = app
        .clone()
        .oneshot(post_json(
            "/webhook",
            json!({"action": "market_scan", "analyzeQueued": true}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["candidates"].as_array().unwrap().len(), 3);
    assert_eq!(body["analysis"]["summary"]["signalsCreated"], 3);
    assert!(body["apiUsage"]["minute"]["used"].as_u64().unwrap() > 0);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/signals?min_score=70")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let signals = body_json(resp).await;
    assert_eq!(signals.as_array().unwrap().len(), 3);
}
