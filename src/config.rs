//! Runtime configuration
//!
//! Read from the process environment (after `.env` has been loaded by the
//! binary). Every knob has a default except the warehouse connection and
//! the staleness tolerance, which are opt-in.

use crate::error::{NqlError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NqlConfig {
    /// Gate for v0.2 plan fields.
    pub v2_enabled: bool,
    pub semantic_model_path: PathBuf,
    pub canonical_db_path: PathBuf,
    /// Read-only analytical store used for vocabulary queries.
    pub warehouse_db_path: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Upper bound for every store I/O step.
    pub store_timeout: Duration,
    pub max_staleness: Option<Duration>,
    pub fuzzy_threshold: f64,
    pub max_suggestions: usize,
    pub max_vocabulary: usize,
}

impl Default for NqlConfig {
    fn default() -> Self {
        Self {
            v2_enabled: true,
            semantic_model_path: PathBuf::from("semantic.json"),
            canonical_db_path: PathBuf::from("canonical.db"),
            warehouse_db_path: None,
            poll_interval: Duration::from_millis(1000),
            store_timeout: Duration::from_millis(2000),
            max_staleness: None,
            fuzzy_threshold: 0.75,
            max_suggestions: 5,
            max_vocabulary: 500,
        }
    }
}

impl NqlConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            v2_enabled: get("NQL_V2_ENABLED")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.v2_enabled),
            semantic_model_path: get("NQL_SEMANTIC_MODEL")
                .map(PathBuf::from)
                .unwrap_or(defaults.semantic_model_path),
            canonical_db_path: get("NQL_CANONICAL_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.canonical_db_path),
            warehouse_db_path: get("NQL_WAREHOUSE_DB").map(PathBuf::from),
            poll_interval: parse_opt::<u64>("NQL_CANONICAL_POLL_MS", get("NQL_CANONICAL_POLL_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            store_timeout: parse_opt::<u64>("NQL_STORE_TIMEOUT_MS", get("NQL_STORE_TIMEOUT_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            max_staleness: parse_opt::<u64>(
                "NQL_CANONICAL_MAX_STALENESS_SECS",
                get("NQL_CANONICAL_MAX_STALENESS_SECS"),
            )?
            .map(Duration::from_secs),
            fuzzy_threshold: parse_opt::<f64>("NQL_FUZZY_THRESHOLD", get("NQL_FUZZY_THRESHOLD"))?
                .unwrap_or(defaults.fuzzy_threshold),
            max_suggestions: parse_opt::<usize>("NQL_MAX_SUGGESTIONS", get("NQL_MAX_SUGGESTIONS"))?
                .unwrap_or(defaults.max_suggestions),
            max_vocabulary: parse_opt::<usize>("NQL_MAX_VOCABULARY", get("NQL_MAX_VOCABULARY"))?
                .unwrap_or(defaults.max_vocabulary),
        };

        if !(0.0..=1.0).contains(&config.fuzzy_threshold) {
            return Err(NqlError::Config(format!(
                "NQL_FUZZY_THRESHOLD must be within [0, 1], got {}",
                config.fuzzy_threshold
            )));
        }
        if config.poll_interval.is_zero() {
            return Err(NqlError::Config("NQL_CANONICAL_POLL_MS must be positive".to_string()));
        }
        Ok(config)
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_opt<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| NqlError::Config(format!("{} has malformed value '{}'", key, value))),
    }
}
