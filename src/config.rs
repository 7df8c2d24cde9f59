//! Environment-variable configuration, parsed once at startup.
//!
//! Mirrors the table in the design's external-interfaces section. All
//! variables are optional; missing ones fall back to defaults, and
//! values that fail to parse or fall outside their valid range are a
//! fatal startup error (see [`crate::error::ConfigError`]).

use std::time::Duration;

use crate::error::ConfigError;

/// Fully parsed, immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL, e.g. `http://127.0.0.1:8081`.
    pub llama_url: String,
    /// Number of concurrent inference slots the backend offers.
    pub n_slots: u32,
    /// Inbound listen port.
    pub port: u16,
    /// Directory holding one metadata record per cache entry.
    pub meta_dir: std::path::PathBuf,
    /// Minimum prompt word count to engage caching.
    pub big_threshold_words: usize,
    /// Block granularity for fingerprinting.
    pub words_per_block: usize,
    /// Similarity threshold in [0, 1].
    pub lcp_th: f64,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Backend's KV-file directory, scanned by the janitor.
    pub cache_dir: std::path::PathBuf,
    /// Zero disables age-based eviction.
    pub cache_max_age: Option<Duration>,
    /// Upper bound, in bytes, for the janitor's size pass.
    pub cache_max_size_bytes: u64,
    /// Janitor tick period.
    pub cache_cleanup_interval: Duration,
}

impl Config {
    /// Parse configuration from the process environment, applying
    /// defaults and validating ranges. Returns `Err` on any value that
    /// cannot be interpreted — this is always a fatal startup error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llama_url = env_or("LLAMA_URL", "http://127.0.0.1:8080");

        let n_slots = parse_env("N_SLOTS", 1u32)?;
        if n_slots == 0 {
            return Err(ConfigError::InvalidValue {
                name: "N_SLOTS",
                value: n_slots.to_string(),
                reason: "must be >= 1".to_string(),
            });
        }

        let port = parse_env("PORT", 8099u16)?;

        let meta_dir = std::path::PathBuf::from(env_or("META_DIR", "./cache-meta"));
        std::fs::create_dir_all(&meta_dir).map_err(|source| ConfigError::MetaDirUnreadable {
            path: meta_dir.display().to_string(),
            source,
        })?;

        let big_threshold_words = parse_env("BIG_THRESHOLD_WORDS", 100usize)?;
        let words_per_block = parse_env("WORDS_PER_BLOCK", 32usize)?;
        if words_per_block == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORDS_PER_BLOCK",
                value: "0".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }

        let lcp_th = parse_env("LCP_TH", 0.6f64)?;
        if !(0.0..=1.0).contains(&lcp_th) {
            return Err(ConfigError::InvalidValue {
                name: "LCP_TH",
                value: lcp_th.to_string(),
                reason: "must be in [0, 1]".to_string(),
            });
        }

        let request_timeout = Duration::from_secs(parse_env("REQUEST_TIMEOUT", 120u64)?);

        let cache_dir = std::path::PathBuf::from(env_or("CACHE_DIR", "./cache-kv"));

        let cache_max_age_hours = parse_env("CACHE_MAX_AGE_HOURS", 0u64)?;
        let cache_max_age = if cache_max_age_hours == 0 {
            None
        } else {
            Some(Duration::from_secs(cache_max_age_hours * 3600))
        };

        let cache_max_size_gb = parse_env("CACHE_MAX_SIZE_GB", 10.0f64)?;
        let cache_max_size_bytes = (cache_max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64;

        let cache_cleanup_interval =
            Duration::from_secs(parse_env("CACHE_CLEANUP_INTERVAL_MINUTES", 30u64)? * 60);

        Ok(Config {
            llama_url,
            n_slots,
            port,
            meta_dir,
            big_threshold_words,
            words_per_block,
            lcp_th,
            request_timeout,
            cache_dir,
            cache_max_age,
            cache_max_size_bytes,
            cache_cleanup_interval,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: "failed to parse".to_string(),
        }),
    }
}
