//! Webhook and API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ServerState>`.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::CacheStatus;
use crate::engine::coordinator::MAX_BATCH_SYMBOLS;
use crate::engine::{AnalysisCoordinator, MarketOverview};
use crate::quota::ApiUsage;
use crate::storage::SignalQuery;
use crate::types::{
    BatchResult, BatchSummary, MarketCandidate, MarketConditions, MarketScanResult, QuotaWindow,
    ScanFilters, SignalStrength, StockAnalysis, SymbolOutcome, ThubError,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ServerState {
    pub coordinator: Arc<AnalysisCoordinator>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(coordinator: Arc<AnalysisCoordinator>) -> Self {
        Self {
            coordinator,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<ServerState>;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Default and maximum page size for `/api/signals`.
const DEFAULT_SIGNAL_LIMIT: usize = 50;
const MAX_SIGNAL_LIMIT: usize = 200;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// `ThubError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    error: ThubError,
    usage: Option<ApiUsage>,
}

impl ApiError {
    pub fn new(error: ThubError) -> Self {
        Self { error, usage: None }
    }

    fn with_usage(mut self, usage: ApiUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    fn status(&self) -> StatusCode {
        match self.error {
            ThubError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ThubError::Validation(_) => StatusCode::BAD_REQUEST,
            ThubError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
            ThubError::Storage(_) | ThubError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.error {
            ThubError::QuotaExceeded { .. } => "quota_exceeded",
            ThubError::Validation(_) => "validation_error",
            ThubError::Collaborator { .. } => "collaborator_error",
            ThubError::Storage(_) => "storage_error",
            ThubError::Config(_) => "config_error",
        }
    }
}

impl From<ThubError> for ApiError {
    fn from(error: ThubError) -> Self {
        Self::new(error)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_usage: Option<ApiUsage>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after_ms = match self.error {
            ThubError::QuotaExceeded { retry_after_ms, .. } => Some(retry_after_ms),
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            error: self.error.to_string(),
            code: self.code(),
            retry_after_ms,
            api_usage: self.usage,
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(ms) = retry_after_ms {
            let secs = ms.div_ceil(1000).max(1);
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}

fn not_found(what: &str, id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": format!("{what} {id} not found"),
            "code": "not_found",
        })),
    )
        .into_response()
}

fn with_cache_header(status: CacheStatus, body: impl IntoResponse) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(X_CACHE, HeaderValue::from_static(status.as_header()));
    (headers, body).into_response()
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Analyze,
    BatchAnalyze,
    MarketOverview,
    MarketScan,
}

/// Low-priority requests are shed first when quota runs short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub action: WebhookAction,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub filters: Option<ScanFilters>,
    /// For `market_scan`: also analyse the queued symbols.
    #[serde(default)]
    pub analyze_queued: bool,
}

impl WebhookRequest {
    /// Symbols for the analysis actions, checked for count.
    fn symbols(&self) -> Result<Vec<String>, ThubError> {
        let symbols = self.symbols.clone().unwrap_or_default();
        if symbols.is_empty() {
            return Err(ThubError::Validation("symbols must not be empty".into()));
        }
        if symbols.len() > MAX_BATCH_SYMBOLS {
            return Err(ThubError::Validation(format!(
                "at most {MAX_BATCH_SYMBOLS} symbols allowed, got {}",
                symbols.len()
            )));
        }
        Ok(symbols)
    }
}

/// Scan metadata without the candidate list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub total_symbols: usize,
    pub filtered_symbols: usize,
    pub queued: Vec<String>,
    pub filters: ScanFilters,
    pub conditions: MarketConditions,
    pub scan_time_ms: u64,
    pub timed_out: bool,
}

impl ScanSummary {
    fn split(scan: MarketScanResult) -> (Self, Vec<MarketCandidate>) {
        (
            Self {
                scan_id: scan.scan_id,
                total_symbols: scan.total_symbols,
                filtered_symbols: scan.filtered_symbols,
                queued: scan.queued,
                filters: scan.filters,
                conditions: scan.conditions,
                scan_time_ms: scan.scan_time_ms,
                timed_out: scan.timed_out,
            },
            scan.candidates,
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Analysis {
        result: StockAnalysis,
    },
    Batch {
        summary: BatchSummary,
        results: Vec<SymbolOutcome>,
    },
    Overview {
        overview: MarketOverview,
    },
    Scan {
        summary: ScanSummary,
        candidates: Vec<MarketCandidate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        analysis: Option<BatchResult>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub success: bool,
    pub action: WebhookAction,
    #[serde(flatten)]
    pub payload: WebhookPayload,
    pub api_usage: ApiUsage,
    /// Milliseconds spent handling the request.
    pub execution_time: u64,
}

/// POST /webhook
pub async fn webhook(
    State(state): State<AppState>,
    Json(req): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let started = Instant::now();
    let coordinator = &state.coordinator;
    info!(action = ?req.action, priority = ?req.priority, "Webhook received");

    let payload = dispatch(coordinator, &req)
        .await
        .map_err(|e| ApiError::new(e).with_usage(coordinator.api_usage()))?;

    Ok(Json(WebhookResponse {
        success: true,
        action: req.action,
        payload,
        api_usage: coordinator.api_usage(),
        execution_time: started.elapsed().as_millis() as u64,
    }))
}

async fn dispatch(
    coordinator: &Arc<AnalysisCoordinator>,
    req: &WebhookRequest,
) -> Result<WebhookPayload, ThubError> {
    let quota_bound = !matches!(req.action, WebhookAction::MarketOverview);
    if quota_bound && req.priority == Priority::Low && coordinator.governor().is_approaching_limit()
    {
        let retry_after_ms = coordinator.governor().stats().minute.reset_in_ms;
        warn!(action = ?req.action, "Shedding low-priority request near quota limit");
        return Err(ThubError::QuotaExceeded {
            retry_after_ms,
            window: QuotaWindow::Minute,
        });
    }

    match req.action {
        WebhookAction::Analyze => {
            let symbols = req.symbols()?;
            let [symbol] = symbols.as_slice() else {
                return Err(ThubError::Validation(format!(
                    "analyze takes exactly one symbol, got {}; use batch_analyze",
                    symbols.len()
                )));
            };
            let result = coordinator.analyze_stock(symbol).await?;
            Ok(WebhookPayload::Analysis { result })
        }
        WebhookAction::BatchAnalyze => {
            let batch = coordinator.analyze_batch(req.symbols()?, None).await?;
            Ok(WebhookPayload::Batch {
                summary: batch.summary,
                results: batch.results,
            })
        }
        WebhookAction::MarketOverview => {
            let overview = coordinator.market_overview().await?;
            Ok(WebhookPayload::Overview {
                overview: overview.value,
            })
        }
        WebhookAction::MarketScan => {
            let (scan, analysis) = if req.analyze_queued {
                let out = coordinator.scan_and_analyze(req.filters.clone(), None).await?;
                (out.scan, out.analysis)
            } else {
                (coordinator.scan_market(req.filters.clone()).await?, None)
            };
            let (summary, candidates) = ScanSummary::split(scan);
            Ok(WebhookPayload::Scan {
                summary,
                candidates,
                analysis,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

/// GET /api/usage
pub async fn get_usage(State(state): State<AppState>) -> Json<ApiUsage> {
    Json(state.coordinator.api_usage())
}

/// GET /api/overview
pub async fn get_overview(State(state): State<AppState>) -> Result<Response, ApiError> {
    let cached = state.coordinator.market_overview().await?;
    Ok(with_cache_header(cached.status, Json(cached.value)))
}

#[derive(Debug, Default, Deserialize)]
pub struct SignalsParams {
    pub strength: Option<String>,
    pub min_score: Option<f64>,
    pub saved: Option<bool>,
    #[serde(default)]
    pub include_expired: bool,
    pub limit: Option<usize>,
}

impl SignalsParams {
    fn into_query(self) -> Result<SignalQuery, ThubError> {
        let strength = self
            .strength
            .map(|s| s.parse::<SignalStrength>())
            .transpose()
            .map_err(ThubError::Validation)?;
        if self.min_score.is_some_and(|m| !m.is_finite()) {
            return Err(ThubError::Validation("min_score must be a number".into()));
        }
        Ok(SignalQuery {
            strength,
            min_score: self.min_score,
            saved: self.saved,
            include_expired: self.include_expired,
            limit: Some(
                self.limit
                    .unwrap_or(DEFAULT_SIGNAL_LIMIT)
                    .clamp(1, MAX_SIGNAL_LIMIT),
            ),
        })
    }
}

/// GET /api/signals
pub async fn get_signals(
    State(state): State<AppState>,
    Query(params): Query<SignalsParams>,
) -> Result<Response, ApiError> {
    let query = params.into_query()?;
    let cached = state.coordinator.signals(&query).await?;
    Ok(with_cache_header(cached.status, Json(cached.value)))
}

/// POST /api/signals/:id/view
pub async fn mark_viewed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    if state.coordinator.mark_viewed(id).await? {
        Ok(Json(serde_json::json!({ "success": true, "id": id, "viewed": true })).into_response())
    } else {
        Ok(not_found("signal", id))
    }
}

/// POST /api/signals/:id/save
pub async fn toggle_saved(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.coordinator.toggle_saved(id).await? {
        Some(saved) => Ok(Json(serde_json::json!({
            "success": true,
            "id": id,
            "saved": saved,
        }))
        .into_response()),
        None => Ok(not_found("signal", id)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub approaching_limit: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        approaching_limit: state.coordinator.governor().is_approaching_limit(),
    })
}
