use std::time::Duration;

use crate::limits::{DEFAULT_BUFFER_AFTER_MS, MAX_ALTERNATIVES, SLOT_GRANULARITY_MS};
use crate::model::Ms;

/// Runtime tunables. Hard caps live in [`crate::limits`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a commit waits for the per-staff write lock before
    /// giving up with `Busy`.
    pub lock_timeout: Duration,
    /// How long a previously seen idempotency key keeps returning the
    /// original appointment instead of re-validating.
    pub idempotency_window_ms: Ms,
    /// Step between candidate slot starts.
    pub slot_granularity_ms: Ms,
    /// Alternative slots attached to a conflict response.
    pub max_alternatives: usize,
    /// Trailing buffer for services that don't declare one.
    pub default_buffer_after_ms: Ms,
    /// Journal appends before the janitor rewrites it.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            idempotency_window_ms: 60 * 60 * 1000,
            slot_granularity_ms: SLOT_GRANULARITY_MS,
            max_alternatives: MAX_ALTERNATIVES,
            default_buffer_after_ms: DEFAULT_BUFFER_AFTER_MS,
            compact_threshold: 1000,
        }
    }
}

impl EngineConfig {
    /// Build a config from `SHEARS_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: env_parse("SHEARS_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            idempotency_window_ms: env_parse("SHEARS_IDEMPOTENCY_WINDOW_MS")
                .unwrap_or(defaults.idempotency_window_ms),
            slot_granularity_ms: env_parse("SHEARS_SLOT_GRANULARITY_MS")
                .unwrap_or(defaults.slot_granularity_ms),
            max_alternatives: env_parse("SHEARS_MAX_ALTERNATIVES")
                .unwrap_or(defaults.max_alternatives),
            default_buffer_after_ms: env_parse("SHEARS_DEFAULT_BUFFER_MS")
                .unwrap_or(defaults.default_buffer_after_ms),
            compact_threshold: env_parse("SHEARS_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.slot_granularity_ms, 5 * 60 * 1000);
        assert_eq!(cfg.default_buffer_after_ms, 15 * 60 * 1000);
        assert!(cfg.lock_timeout > Duration::ZERO);
    }
}
