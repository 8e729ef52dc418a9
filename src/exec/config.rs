//! Executor tuning knobs and their defaults.

use chrono::Duration;
use std::sync::Once;

static LOAD_DOTENV: Once = Once::new();

/// Default cancellation window when a cancel trigger declares no timeout.
const DEFAULT_CANCEL_TIMEOUT_DAYS: i64 = 30;

/// Configuration for an [`Executor`](crate::exec::Executor).
///
/// Defaults match production tuning; tests lower the bounds to exercise the
/// edges.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// How long a cancellation pause stays armed when the trigger declares
    /// no timeout of its own.
    pub cancel_timeout: Duration,
    /// Weighted-semaphore bound on concurrent pause handling.
    pub pause_handle_concurrency: usize,
    /// Candidate-count threshold above which the aggregate index is used
    /// instead of the naive scan.
    pub aggregate_pause_threshold: usize,
    /// Attempts allowed for the initial source-edge item.
    pub source_edge_retries: u32,
    /// Maximum memoized steps per run before the run is failed.
    pub max_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: Duration::days(DEFAULT_CANCEL_TIMEOUT_DAYS),
            pause_handle_concurrency: 100,
            aggregate_pause_threshold: 10,
            source_edge_retries: 20,
            max_steps: 1000,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overlaid with `STEPLINE_*` environment variables, loading a
    /// `.env` file once if one is present.
    #[must_use]
    pub fn from_env() -> Self {
        LOAD_DOTENV.call_once(|| {
            let _ = dotenvy::dotenv();
        });
        let mut config = Self::default();
        if let Some(hours) = env_parse::<i64>("STEPLINE_CANCEL_TIMEOUT_HOURS") {
            config.cancel_timeout = Duration::hours(hours);
        }
        if let Some(n) = env_parse("STEPLINE_PAUSE_CONCURRENCY") {
            config.pause_handle_concurrency = n;
        }
        if let Some(n) = env_parse("STEPLINE_AGGREGATE_PAUSE_THRESHOLD") {
            config.aggregate_pause_threshold = n;
        }
        if let Some(n) = env_parse("STEPLINE_MAX_STEPS") {
            config.max_steps = n;
        }
        config
    }

    #[must_use]
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_aggregate_pause_threshold(mut self, threshold: usize) -> Self {
        self.aggregate_pause_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_tuning() {
        let config = ExecutorConfig::default();
        assert_eq!(config.pause_handle_concurrency, 100);
        assert_eq!(config.aggregate_pause_threshold, 10);
        assert_eq!(config.source_edge_retries, 20);
        assert_eq!(config.max_steps, 1000);
    }
}
