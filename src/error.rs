//! Crate-wide error type.
//!
//! Corresponds to the error kinds enumerated in the design's error
//! handling section: errors that are surfaced to clients map to HTTP
//! status codes via `IntoResponse`; errors that are absorbed internally
//! (restore/save/metadata-write/janitor failures) are logged at their
//! call site and never constructed as a `ProxyError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors that can be returned to an HTTP caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed body, missing model, or empty prompt. Not retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Backend unreachable or returned a non-success status.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Per-request deadline exceeded.
    #[error("gateway timeout")]
    GatewayTimeout,

    /// No slot became available before the deadline.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Anything else — programmer error or an invariant violation.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ProxyError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ProxyError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ProxyError::GatewayTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "request deadline exceeded".to_string(),
            ),
            ProxyError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ProxyError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Fatal startup configuration error. Distinct from `ProxyError` because
/// it never reaches an HTTP response — it aborts `main` before the
/// server binds a listener.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("META_DIR {path:?} is not a readable directory: {source}")]
    MetaDirUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
