//! Axum route handlers for the caching proxy.
//!
//! # Routes
//!
//! - `POST /v1/chat/completions` — chat-style completion, cache-aware
//! - `POST /v1/completions`      — completions-style, cache-aware
//! - `GET  /v1/models`           — passthrough to backend model discovery
//! - `GET  /v1/internal/:model/slots` — model-scoped slot inspection
//! - `GET  /health`              — liveness probe + slot/janitor summary

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::coordinator::Coordinator;
use crate::error::ProxyError;
use crate::slot_manager::SlotManager;
use crate::upstream::Upstream;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub upstream: Arc<dyn Upstream>,
    pub slots: SlotManager,
    pub request_timeout: Duration,
    /// Set by the janitor after each sweep; read by `/health`.
    pub janitor_last_run: Arc<RwLock<Option<SystemTime>>>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/chat/completions", post(completion_handler))
        .route("/v1/completions", post(completion_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/internal/{model}/slots", get(slots_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let slots: Vec<_> = state
        .slots
        .snapshot()
        .into_iter()
        .map(|(id, phase, resident)| {
            serde_json::json!({
                "slot_id": id,
                "phase": format!("{:?}", phase),
                "resident_entry": resident,
            })
        })
        .collect();

    let janitor_last_run = state
        .janitor_last_run
        .read()
        .map(chrono::DateTime::<chrono::Utc>::from)
        .map(|t| t.to_rfc3339());

    Json(serde_json::json!({
        "status": "ok",
        "slots": slots,
        "janitor_last_run": janitor_last_run,
    }))
}

/// Shared handler for both chat-completions and completions routes —
/// the coordinator distinguishes them only by which field it reads the
/// prompt text from.
async fn completion_handler(
    State(state): State<AppState>,
    axum::extract::OriginalUri(uri): axum::extract::OriginalUri,
    body: axum::body::Bytes,
) -> Result<Response, ProxyError> {
    let cancel = CancellationToken::new();
    let cancel_guard = cancel.clone();

    let response = tokio::time::timeout(
        state.request_timeout,
        state.coordinator.handle(uri.path(), body, cancel),
    )
    .await;

    match response {
        Ok(Ok(upstream_response)) => {
            let mut builder = axum::http::Response::builder()
                .status(StatusCode::from_u16(upstream_response.status).unwrap_or(StatusCode::OK));
            if let Some(ct) = &upstream_response.content_type {
                builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
            }
            Ok(builder
                .body(upstream_response.into_axum_body())
                .expect("response builder with known-valid parts never fails"))
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            cancel_guard.cancel();
            Err(ProxyError::GatewayTimeout)
        }
    }
}

async fn models_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ProxyError> {
    let value = state
        .upstream
        .passthrough_models()
        .await
        .map_err(|e| ProxyError::BadGateway(e.to_string()))?;
    Ok(Json(value))
}

async fn slots_handler(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let value = state
        .upstream
        .list_slots(&model)
        .await
        .map_err(|e| ProxyError::BadGateway(e.to_string()))?;
    Ok(Json(value))
}
