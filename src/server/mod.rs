//! HTTP server layer: axum router construction and shared application
//! state. Kept thin — the interesting logic lives in
//! [`crate::coordinator::Coordinator`]; this module only does request
//! extraction and response framing.

pub mod routes;

pub use routes::{app_router, AppState};
