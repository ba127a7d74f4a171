//! Engine configuration loaded from environment variables.
//!
//! All settings have defaults, so an embedder can start with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    CACHE_RETRY_ATTEMPTS, CACHE_RETRY_BASE_MS, DEFAULT_PAGE_SIZE, TYPING_TIMEOUT_MS,
};

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages loaded per local backfill page.
    /// Env: `PARLEY_PAGE_SIZE`
    /// Default: `20`
    pub page_size: usize,

    /// Own typing flag is cleared after this long without an explicit clear.
    /// Env: `PARLEY_TYPING_TIMEOUT_MS`
    /// Default: `3000`
    pub typing_timeout: Duration,

    /// Attempts for a local cache write that keeps hitting revision conflicts.
    /// Env: `PARLEY_CACHE_RETRY_ATTEMPTS`
    /// Default: `4`
    pub cache_retry_attempts: u32,

    /// Backoff before the first cache retry, doubled on every further one.
    /// Env: `PARLEY_CACHE_RETRY_BASE_MS`
    /// Default: `15`
    pub cache_retry_base: Duration,

    /// Local cache file. `None` uses the platform data directory.
    /// Env: `PARLEY_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Capacity of the [`SyncEvent`](crate::SyncEvent) broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            typing_timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
            cache_retry_attempts: CACHE_RETRY_ATTEMPTS,
            cache_retry_base: Duration::from_millis(CACHE_RETRY_BASE_MS),
            db_path: None,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_var::<usize>(&lookup, "PARLEY_PAGE_SIZE") {
            if size == 0 {
                tracing::warn!("PARLEY_PAGE_SIZE must be positive, using default");
            } else {
                config.page_size = size;
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_TYPING_TIMEOUT_MS") {
            config.typing_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = parse_var::<u32>(&lookup, "PARLEY_CACHE_RETRY_ATTEMPTS") {
            config.cache_retry_attempts = attempts.max(1);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_CACHE_RETRY_BASE_MS") {
            config.cache_retry_base = Duration::from_millis(ms);
        }

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_constants() {
        let config = SyncConfig::from_lookup(lookup(&[]));
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.page_size, 20);
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
    }

    #[test]
    fn overrides_and_invalid_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PARLEY_PAGE_SIZE", "50"),
            ("PARLEY_TYPING_TIMEOUT_MS", "oops"),
            ("PARLEY_CACHE_RETRY_ATTEMPTS", "0"),
            ("PARLEY_DB_PATH", "/tmp/parley.db"),
        ]));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.cache_retry_attempts, 1);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/parley.db")));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let config = SyncConfig::from_lookup(lookup(&[("PARLEY_PAGE_SIZE", "0")]));
        assert_eq!(config.page_size, 20);
    }
}
