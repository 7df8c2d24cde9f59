//! Upstream client — the coordinator's narrow interface to the
//! inference backend. Kept as a trait so tests can substitute an
//! in-memory fake (mirroring the teacher's one-trait-per-provider
//! pattern in `llms::providers`), with a `reqwest`-backed production
//! implementation behind it.

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// A streamed backend response: status code plus a byte stream the
/// coordinator re-wraps verbatim into the client-facing response body.
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
}

impl UpstreamResponse {
    pub fn into_axum_body(self) -> Body {
        Body::from_stream(self.body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned status {status}: {body}")]
    NonSuccess { status: u16, body: String },
}

/// Minimal operations the coordinator needs from the backend. All are
/// scoped per-model where the backend's own API requires it (design
/// §4.5: "routes slot management endpoints through a model-scoped
/// path").
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn list_slots(&self, model: &str) -> Result<Value, UpstreamError>;

    /// Idempotent when the slot already holds `save_id`.
    async fn restore_slot(
        &self,
        model: &str,
        slot_id: u32,
        save_id: &str,
    ) -> Result<(), UpstreamError>;

    async fn save_slot(
        &self,
        model: &str,
        slot_id: u32,
        save_id: &str,
    ) -> Result<(), UpstreamError>;

    async fn forward_completion(
        &self,
        path: &str,
        slot_id: u32,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError>;

    async fn passthrough_models(&self) -> Result<Value, UpstreamError>;
}

/// Production implementation over HTTP, grounded in the teacher's
/// `reqwest::Client`-based remote-call helpers (`chat::fingerprint_cache`,
/// `llms::providers::xai`).
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client config is always valid");
        Self { client, base_url }
    }

    fn model_scoped(&self, model: &str, suffix: &str) -> String {
        format!("{}/v1/internal/{}{}", self.base_url, model, suffix)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn list_slots(&self, model: &str) -> Result<Value, UpstreamError> {
        let resp = self
            .client
            .get(self.model_scoped(model, "/slots"))
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::NonSuccess { status, body });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))
    }

    async fn restore_slot(
        &self,
        model: &str,
        slot_id: u32,
        save_id: &str,
    ) -> Result<(), UpstreamError> {
        let resp = self
            .client
            .post(self.model_scoped(model, "/slots/restore"))
            .json(&serde_json::json!({ "slot_id": slot_id, "save_id": save_id }))
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::NonSuccess { status, body });
        }
        Ok(())
    }

    async fn save_slot(
        &self,
        model: &str,
        slot_id: u32,
        save_id: &str,
    ) -> Result<(), UpstreamError> {
        let resp = self
            .client
            .post(self.model_scoped(model, "/slots/save"))
            .json(&serde_json::json!({ "slot_id": slot_id, "save_id": save_id }))
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::NonSuccess { status, body });
        }
        Ok(())
    }

    async fn forward_completion(
        &self,
        path: &str,
        slot_id: u32,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        use futures::TryStreamExt;

        // Pin the request to the chosen slot via a query parameter, the
        // shape the design leaves as "a detail of the Upstream Client
        // implementation so long as both sides agree".
        let url = format!("{}{}?slot_id={}", self.base_url, path, slot_id);

        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::NonSuccess { status, body });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        Ok(UpstreamResponse {
            status,
            content_type,
            body: Box::pin(stream),
        })
    }

    async fn passthrough_models(&self) -> Result<Value, UpstreamError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::NonSuccess { status, body });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory `Upstream` fake for coordinator tests, recording calls
    //! so tests can assert restore/save sequencing (mirrors the
    //! teacher's pattern of swapping a trait object for a deterministic
    //! stand-in in `#[cfg(test)]`).
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct FakeUpstream {
        pub restore_calls: Mutex<Vec<(String, u32, String)>>,
        pub save_calls: Mutex<Vec<(String, u32, String)>>,
        pub forward_calls: Mutex<Vec<(String, u32)>>,
        pub fail_restore: Mutex<HashSet<String>>,
        pub fail_save: Mutex<HashSet<String>>,
        pub fail_forward: Mutex<bool>,
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn list_slots(&self, _model: &str) -> Result<Value, UpstreamError> {
            Ok(serde_json::json!([]))
        }

        async fn restore_slot(
            &self,
            model: &str,
            slot_id: u32,
            save_id: &str,
        ) -> Result<(), UpstreamError> {
            self.restore_calls
                .lock()
                .push((model.to_string(), slot_id, save_id.to_string()));
            if self.fail_restore.lock().contains(save_id) {
                return Err(UpstreamError::NonSuccess {
                    status: 500,
                    body: "restore failed".to_string(),
                });
            }
            Ok(())
        }

        async fn save_slot(
            &self,
            model: &str,
            slot_id: u32,
            save_id: &str,
        ) -> Result<(), UpstreamError> {
            self.save_calls
                .lock()
                .push((model.to_string(), slot_id, save_id.to_string()));
            if self.fail_save.lock().contains(save_id) {
                return Err(UpstreamError::NonSuccess {
                    status: 500,
                    body: "save failed".to_string(),
                });
            }
            Ok(())
        }

        async fn forward_completion(
            &self,
            path: &str,
            slot_id: u32,
            _body: Bytes,
        ) -> Result<UpstreamResponse, UpstreamError> {
            self.forward_calls.lock().push((path.to_string(), slot_id));
            if *self.fail_forward.lock() {
                return Err(UpstreamError::Unreachable("fake failure".to_string()));
            }
            let chunk: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(b"{\"ok\":true}"));
            Ok(UpstreamResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: Box::pin(futures::stream::iter(vec![chunk])),
            })
        }

        async fn passthrough_models(&self) -> Result<Value, UpstreamError> {
            Ok(serde_json::json!({ "data": [] }))
        }
    }
}
