//! Relay configuration loaded from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use outbox_store::RetryPolicy;
use outbox_store::retry::{
    DEFAULT_BASE_DELAY, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
};

/// Relay settings with sensible defaults.
///
/// Reads from environment variables:
/// - `OUTBOX_POLLING_INTERVAL_MS` (default: `500`)
/// - `OUTBOX_BATCH_SIZE` (default: `50`)
/// - `OUTBOX_BASE_DELAY_MS` (default: `1000`)
/// - `OUTBOX_MAX_BACKOFF_MS` (default: `60000`)
/// - `OUTBOX_JITTER_FACTOR` (default: `0.1`)
/// - `OUTBOX_MAX_RETRIES` (default: `5`)
/// - `OUTBOX_MAX_RETRIES_OVERRIDES`, e.g. `PaymentCaptured=10,OrderShipped=3`
/// - `OUTBOX_LEASE_TIMEOUT_MS` (default: `30000`)
/// - `OUTBOX_REAPER_INTERVAL_MS` (default: `5000`)
/// - `OUTBOX_SHUTDOWN_TIMEOUT_MS` (default: `10000`)
/// - `OUTBOX_WORKERS` (default: `1`)
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Pause between polls when the last batch was not full.
    pub polling_interval: Duration,
    /// Rows fetched per poll and per worker.
    pub batch_size: usize,
    /// How long a lease is held before the reaper may reclaim it. Must exceed
    /// the slowest expected publish.
    pub lease_timeout: Duration,
    pub reaper_interval: Duration,
    /// Upper bound on how long `stop` waits for in-flight publishes.
    pub shutdown_timeout: Duration,
    /// Number of partitioned worker loops.
    pub workers: u32,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            batch_size: 50,
            lease_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            workers: 1,
            retry: RetryPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_parse::<u64>(name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Parses `EventA=3,EventB=10`. Malformed entries are skipped.
pub fn parse_max_retries_overrides(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|entry| {
            let (event_type, value) = entry.split_once('=')?;
            let event_type = event_type.trim();
            if event_type.is_empty() {
                return None;
            }
            let value = value.trim().parse().ok()?;
            Some((event_type.to_string(), value))
        })
        .collect()
}

impl RelayConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut retry = RetryPolicy::new(
            env_millis("OUTBOX_BASE_DELAY_MS", DEFAULT_BASE_DELAY),
            env_millis("OUTBOX_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF),
            env_parse("OUTBOX_JITTER_FACTOR").unwrap_or(DEFAULT_JITTER_FACTOR),
            env_parse("OUTBOX_MAX_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES),
        );
        if let Ok(raw) = std::env::var("OUTBOX_MAX_RETRIES_OVERRIDES") {
            retry.max_retries_by_event_type = parse_max_retries_overrides(&raw);
        }

        Self {
            polling_interval: env_millis("OUTBOX_POLLING_INTERVAL_MS", defaults.polling_interval),
            batch_size: env_parse("OUTBOX_BATCH_SIZE")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.batch_size),
            lease_timeout: env_millis("OUTBOX_LEASE_TIMEOUT_MS", defaults.lease_timeout),
            reaper_interval: env_millis("OUTBOX_REAPER_INTERVAL_MS", defaults.reaper_interval),
            shutdown_timeout: env_millis("OUTBOX_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            workers: env_parse("OUTBOX_WORKERS")
                .filter(|&n: &u32| n > 0)
                .unwrap_or(defaults.workers),
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
