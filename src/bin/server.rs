//! llama-cache-proxy HTTP server binary.
//!
//! Starts an axum HTTP server that proxies completion requests to an
//! inference backend, transparently reusing cached KV-attention prefix
//! state for long prompts.
//!
//! # Environment Variables
//!
//! See `SPEC_FULL.md` §6 for the full table (`LLAMA_URL`, `N_SLOTS`,
//! `PORT`, `META_DIR`, `BIG_THRESHOLD_WORDS`, `WORDS_PER_BLOCK`,
//! `LCP_TH`, `REQUEST_TIMEOUT`, `CACHE_DIR`, `CACHE_MAX_AGE_HOURS`,
//! `CACHE_MAX_SIZE_GB`, `CACHE_CLEANUP_INTERVAL_MINUTES`, `RUST_LOG`).
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin llama-cache-proxy
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use parking_lot::RwLock;

use llama_cache_proxy::config::Config;
use llama_cache_proxy::coordinator::Coordinator;
use llama_cache_proxy::janitor::Janitor;
use llama_cache_proxy::lcp_index::LcpIndex;
use llama_cache_proxy::metadata::MetadataStore;
use llama_cache_proxy::server::{app_router, AppState};
use llama_cache_proxy::upstream::HttpUpstream;

/// BSD sysexits `EX_CONFIG`: used for fatal startup configuration
/// errors, per `SPEC_FULL.md` §7.
const EX_CONFIG: u8 = 78;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llama_cache_proxy=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(EX_CONFIG);
        }
    };

    let (metadata, corrupt) = match MetadataStore::load(&config.meta_dir) {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, meta_dir = %config.meta_dir.display(), "failed to read META_DIR");
            return ExitCode::from(EX_CONFIG);
        }
    };
    for record in &corrupt {
        tracing::warn!(path = %record.path.display(), reason = %record.reason, "quarantined corrupt metadata record at startup");
    }

    let index = Arc::new(LcpIndex::new());
    index.rebuild(metadata.all());

    let slots = llama_cache_proxy::slot_manager::SlotManager::new(config.n_slots);
    let upstream: Arc<dyn llama_cache_proxy::upstream::Upstream> = Arc::new(HttpUpstream::new(
        config.llama_url.clone(),
        config.request_timeout,
    ));

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        metadata.clone(),
        index.clone(),
        slots.clone(),
        upstream.clone(),
    ));

    let janitor_last_run = Arc::new(RwLock::new(None));
    {
        let janitor = Janitor::new(
            metadata.clone(),
            index.clone(),
            config.cache_dir.clone(),
            config.cache_max_age,
            config.cache_max_size_bytes,
        );
        let interval = config.cache_cleanup_interval;
        let last_run = janitor_last_run.clone();
        tokio::spawn(janitor.run_forever(interval, last_run));
    }

    let state = AppState {
        coordinator,
        upstream,
        slots,
        request_timeout: config.request_timeout,
        janitor_last_run,
    };

    let app = app_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, bind_addr = %bind_addr, "failed to bind listener");
            return ExitCode::from(EX_CONFIG);
        }
    };

    tracing::info!(bind_addr = %bind_addr, llama_url = %config.llama_url, n_slots = config.n_slots, "llama-cache-proxy starting");

    let shutdown = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        tracing::info!("shutdown signal received, draining in-flight requests");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %err, "server error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
