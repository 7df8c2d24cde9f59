//! Request coordinator — orchestrates one completion request end to
//! end: fingerprint, candidate lookup, slot assignment, optional
//! restore, backend forward, optional admission, release.
//!
//! This is the seam every other module exists to serve; see design
//! §4.6 for the numbered algorithm this function implements step by
//! step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProxyError;
use crate::fingerprint;
use crate::lcp_index::LcpIndex;
use crate::metadata::{CacheEntry, MetadataStore};
use crate::slot_manager::SlotManager;
use crate::upstream::{Upstream, UpstreamResponse};

/// How this request's cache lookup resolved, surfaced for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    BelowThreshold,
    Miss,
    PartialHit,
    FullHit,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::BelowThreshold => "skip-below-threshold",
            CacheOutcome::Miss => "miss",
            CacheOutcome::PartialHit => "partial",
            CacheOutcome::FullHit => "hit",
        }
    }
}

pub struct Coordinator {
    config: Arc<Config>,
    metadata: MetadataStore,
    index: Arc<LcpIndex>,
    slots: SlotManager,
    upstream: Arc<dyn Upstream>,
    next_request_id: AtomicU64,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        metadata: MetadataStore,
        index: Arc<LcpIndex>,
        slots: SlotManager,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            config,
            metadata,
            index,
            slots,
            upstream,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Extract `model` and the concatenated prompt text the backend
    /// would see, from either a chat-style (`messages: [...]`) or
    /// completions-style (`prompt: "..."`) request body.
    pub fn parse_prompt(body: &Value) -> Result<(String, String), ProxyError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::BadRequest("missing 'model' field".to_string()))?
            .to_string();

        let mut text = String::new();

        if let Some(preamble) = body.get("system").and_then(Value::as_str) {
            text.push_str(preamble);
            text.push(' ');
        }

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                if let Some(content) = message.get("content").and_then(Value::as_str) {
                    text.push_str(content);
                    text.push(' ');
                }
            }
        } else if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
            text.push_str(prompt);
        } else {
            return Err(ProxyError::BadRequest(
                "missing 'messages' or 'prompt' field".to_string(),
            ));
        }

        if text.trim().is_empty() {
            return Err(ProxyError::BadRequest("empty prompt".to_string()));
        }

        Ok((model, text))
    }

    /// Run the full per-request algorithm and return the backend's
    /// streamed response, ready to be forwarded verbatim to the client.
    pub async fn handle(
        &self,
        path: &str,
        raw_body: Bytes,
        cancel: CancellationToken,
    ) -> Result<UpstreamResponse, ProxyError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let parsed: Value = serde_json::from_slice(&raw_body)
            .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))?;
        let (model, prompt_text) = Self::parse_prompt(&parsed)?;

        let fp = fingerprint::fingerprint(&prompt_text, self.config.words_per_block);

        let (candidate, outcome) = if fp.word_count < self.config.big_threshold_words
            || fp.signatures.is_empty()
        {
            (None, CacheOutcome::BelowThreshold)
        } else {
            match self.index.best_candidate(&model, &fp, self.config.lcp_th) {
                Some(cand) => {
                    let outcome = if cand.match_len == fp.signatures.len() {
                        CacheOutcome::FullHit
                    } else {
                        CacheOutcome::PartialHit
                    };
                    (Some(cand.entry), outcome)
                }
                None => (None, CacheOutcome::Miss),
            }
        };

        let span = tracing::info_span!(
            "completion_request",
            request_id,
            model = %model,
            cache_outcome = outcome.as_str(),
        );
        let _enter = span.enter();

        let preferred_save_id = candidate.as_ref().map(|e| e.save_id.clone());

        let slot_id = tokio::select! {
            result = self.slots.assign(request_id, preferred_save_id.clone(), self.config.request_timeout) => {
                result.map_err(|_| ProxyError::ServiceUnavailable("no slot available before deadline".to_string()))?
            }
            _ = cancel.cancelled() => {
                return Err(ProxyError::GatewayTimeout);
            }
        };

        // Step 6: restore, downgrading to no-reuse on failure rather
        // than failing the request. Called unconditionally whenever
        // there's a candidate — `restore_slot` is idempotent, so there's
        // no need to track slot residency on this side to decide
        // whether it's worth issuing; the preferred-slot optimization in
        // `SlotManager` instead makes the common case (the slot the
        // backend would restore into already holds this entry) cheap.
        let mut effective_entry = candidate;
        if let Some(entry) = &effective_entry {
            let restore = self.upstream.restore_slot(&model, slot_id, &entry.save_id);
            let restore_result = tokio::select! {
                result = restore => result,
                _ = cancel.cancelled() => {
                    self.slots.release(slot_id, None);
                    return Err(ProxyError::GatewayTimeout);
                }
            };

            if let Err(err) = restore_result {
                tracing::warn!(error = %err, save_id = %entry.save_id, "restore failed, proceeding without prefix reuse");
                effective_entry = None;
            } else {
                if let Err(err) = self.metadata.touch(&entry.save_id) {
                    tracing::warn!(error = %err, save_id = %entry.save_id, "touch failed, last_used_at may be stale on disk");
                }
                self.index.mark_used(&entry.save_id, std::time::SystemTime::now());
            }
        }

        self.slots.mark_busy(slot_id, request_id);

        // Step 7: forward, cancellable.
        let forward = self.upstream.forward_completion(path, slot_id, raw_body);
        let response = tokio::select! {
            result = forward => result,
            _ = cancel.cancelled() => {
                self.slots.release(slot_id, effective_entry.map(|e| e.save_id));
                return Err(ProxyError::GatewayTimeout);
            }
        };

        let response = match response {
            Ok(resp) => resp,
            Err(err) => {
                self.slots.release(slot_id, effective_entry.map(|e| e.save_id));
                return Err(ProxyError::BadGateway(err.to_string()));
            }
        };

        // Step 8: admission. Only for prompts at/above threshold where
        // we either missed entirely or learned a strictly longer
        // fingerprint than what we restored.
        let learned_more = effective_entry
            .as_ref()
            .map(|e| {
                let existing = e.fingerprint();
                existing.signatures.len() < fp.signatures.len()
                    && fp.signatures.starts_with(&existing.signatures)
            })
            .unwrap_or(true);

        let mut released_entry_id = effective_entry.as_ref().map(|e| e.save_id.clone());

        if fp.word_count >= self.config.big_threshold_words && learned_more {
            let save_id = Uuid::new_v4().to_string();
            let save = self.upstream.save_slot(&model, slot_id, &save_id);
            let save_result = tokio::select! {
                result = save => result,
                _ = cancel.cancelled() => {
                    self.slots.release(slot_id, released_entry_id);
                    return Err(ProxyError::GatewayTimeout);
                }
            };

            match save_result {
                Ok(()) => {
                    let entry = CacheEntry::new(save_id.clone(), model.clone(), fp.clone());
                    match self.metadata.insert(entry.clone()) {
                        Ok(()) => {
                            self.index.insert(entry);
                            released_entry_id = Some(save_id);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "metadata write failed, skipping admission");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "save failed, skipping admission");
                }
            }
        }

        // Step 9.
        self.slots.release(slot_id, released_entry_id);

        Ok(response)
    }
}
