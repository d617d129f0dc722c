//! HTTP ingress: the webhook plus a small read API.
//!
//! Quota denials come back as 429 with `Retry-After`; validation errors as
//! 400; upstream failures as 502. CORS is open for local dashboards.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AppState, ServerState};

/// Bind `addr` and serve in a background task.
///
/// Binding happens before this returns, so a taken port is reported to
/// the caller rather than inside the task.
pub async fn spawn_server(state: AppState, addr: SocketAddr) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(%addr, "HTTP server listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server stopped");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/webhook", post(routes::webhook))
        .route("/api/usage", get(routes::get_usage))
        .route("/api/overview", get(routes::get_overview))
        .route("/api/signals", get(routes::get_signals))
        .route("/api/signals/:id/view", post(routes::mark_viewed))
        .route("/api/signals/:id/save", post(routes::toggle_saved))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
