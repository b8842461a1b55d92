//! Exponential backoff and retry budget for failed publishes.
//!
//! ```text
//! retry_count   backoff (base = 1s, cap = 60s)   with jitter (factor 0.1)
//! ──────────────────────────────────────────────────────────────────────
//!      1                 2s                         2.0s - 2.2s
//!      2                 4s                         4.0s - 4.4s
//!      3                 8s                         8.0s - 8.8s
//!      6                60s                        60s (capped)
//! ```
//!
//! Jitter only ever widens the delay and the result is clamped to the cap, so
//! consecutive delays of one message never shrink.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Default base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Default cap on a single backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default jitter factor (up to +10%).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default number of failed attempts before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Jitter factors at or above 1.0 could make a delay exceed the next step.
const MAX_JITTER_FACTOR: f64 = 0.99;

/// Retry budget and backoff schedule for outbox messages.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
    pub max_retries: u32,
    /// Per-event-type overrides of `max_retries`.
    pub max_retries_by_event_type: HashMap<String, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retries_by_event_type: HashMap::new(),
        }
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RetryPolicy(base_delay={}ms, max_backoff={}ms, jitter={:.1}%, max_retries={}, overrides={})",
            self.base_delay.as_millis(),
            self.max_backoff.as_millis(),
            self.jitter_factor * 100.0,
            self.max_retries,
            self.max_retries_by_event_type.len()
        )
    }
}

impl RetryPolicy {
    pub fn new(
        base_delay: Duration,
        max_backoff: Duration,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay,
            max_backoff,
            jitter_factor,
            max_retries,
            max_retries_by_event_type: HashMap::new(),
        }
    }

    /// Policy that retries immediately, handy for tests and local tooling.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0, max_retries)
    }

    /// Overrides the retry budget for one event type.
    pub fn with_max_retries_for(mut self, event_type: impl Into<String>, max_retries: u32) -> Self {
        self.max_retries_by_event_type
            .insert(event_type.into(), max_retries);
        self
    }

    /// Retry budget for the given event type.
    pub fn max_retries_for(&self, event_type: &str) -> u32 {
        self.max_retries_by_event_type
            .get(event_type)
            .copied()
            .unwrap_or(self.max_retries)
    }

    /// Whether a message that has failed `retry_count` times may be retried.
    pub fn can_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// `min(max_backoff, base_delay * 2^retry_count)`, without jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_millis();
        let cap = self.max_backoff.as_millis();
        let factor = if retry_count >= 64 {
            u128::MAX
        } else {
            1u128 << retry_count
        };
        let raw = base.saturating_mul(factor);
        Duration::from_millis(raw.min(cap).min(u64::MAX as u128) as u64)
    }

    /// Backoff widened by a random amount in `[0, backoff * jitter_factor)`,
    /// still capped at `max_backoff`.
    pub fn backoff_with_jitter<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(retry_count);
        let factor = self.jitter_factor.clamp(0.0, MAX_JITTER_FACTOR);
        let range_ms = (backoff.as_millis() as f64 * factor) as u64;
        if range_ms == 0 {
            return backoff;
        }
        let jitter = Duration::from_millis(rng.gen_range(0..range_ms));
        (backoff + jitter).min(self.max_backoff)
    }

    /// Delay to wait before the next attempt, using the thread-local RNG.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff_with_jitter(retry_count, &mut rand::thread_rng())
    }

    /// Timestamp at which a message that has failed `retry_count` times becomes
    /// eligible again.
    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        let delay = chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Jitter-free delays for failures `1..=max_retries - 1`, the ones that are
    /// followed by another attempt.
    pub fn schedule(&self, max_retries: u32) -> Vec<Duration> {
        (1..max_retries).map(|n| self.backoff(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn no_jitter(base_ms: u64, cap_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            0.0,
            5,
        )
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = no_jitter(100, 60_000);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = no_jitter(1_000, 5_000);
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(5_000));
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1_000),
            Duration::from_millis(60_000),
            0.5,
            5,
        );
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 0..5 {
            let plain = policy.backoff(retry);
            let jittered = policy.backoff_with_jitter(retry, &mut rng);
            assert!(jittered >= plain);
            assert!(jittered.as_millis() < plain.as_millis() + plain.as_millis() / 2 + 1);
        }
    }

    #[test]
    fn jittered_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(3_000),
            5.0, // clamped below 1.0
            20,
        );
        let mut rng = StdRng::seed_from_u64(42);
        let mut previous = Duration::ZERO;
        for retry in 1..20 {
            let delay = policy.backoff_with_jitter(retry, &mut rng);
            assert!(delay >= previous, "retry {retry}: {delay:?} < {previous:?}");
            assert!(delay <= policy.max_backoff);
            previous = delay;
        }
        assert_eq!(previous, policy.max_backoff);
    }

    #[test]
    fn max_retries_override_per_event_type() {
        let policy = RetryPolicy::default().with_max_retries_for("PaymentCaptured", 10);
        assert_eq!(policy.max_retries_for("PaymentCaptured"), 10);
        assert_eq!(policy.max_retries_for("OrderCreated"), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn can_retry_until_budget_exhausted() {
        assert!(RetryPolicy::can_retry(0, 3));
        assert!(RetryPolicy::can_retry(2, 3));
        assert!(!RetryPolicy::can_retry(3, 3));
    }

    #[test]
    fn next_retry_at_is_in_the_future() {
        let policy = no_jitter(1_000, 60_000);
        let now = Utc::now();
        let next = policy.next_retry_at(1, now);
        assert_eq!(next - now, chrono::Duration::milliseconds(2_000));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        let now = Utc::now();
        assert_eq!(policy.next_retry_at(2, now), now);
    }

    #[test]
    fn schedule_lists_delays_between_attempts() {
        let policy = no_jitter(10, 60_000);
        assert_eq!(
            policy.schedule(4),
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
    }

    #[test]
    fn display_mentions_key_settings() {
        let text = RetryPolicy::default().to_string();
        assert!(text.contains("base_delay=1000ms"));
        assert!(text.contains("max_retries=5"));
    }
}
