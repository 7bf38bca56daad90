//! Reusable retry/backoff policy
//!
//! One policy object parameterized by attempt ceiling, base delay, delay cap,
//! and jitter bound. Call sites decide retryability by classifying their own
//! errors; this module only computes delays.

use rand::Rng;
use std::time::Duration;

/// Retry policy shared by the generation client and the worker loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Ceiling applied to every computed delay, hints included
    pub max_delay: Duration,
    /// Upper bound on the random jitter added to every delay
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay, jitter }
    }

    /// Exponential backoff delay for the given zero-based attempt,
    /// capped at `max_delay`. Monotonically non-decreasing in `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // Saturate the shift so large attempt counts cannot overflow
        let factor = 2u64.saturating_pow(attempt.min(32));
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Clamp a server-supplied retry hint into [0, max_delay].
    pub fn clamp_hint(&self, hint: Duration) -> Duration {
        hint.min(self.max_delay)
    }

    /// Add bounded random jitter to a delay. Spreads out retries when
    /// several jobs hit the same limit simultaneously.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Whether another attempt is allowed after `attempt` attempts so far.
    pub fn attempts_remain(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            5,
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_backoff_monotonic_up_to_cap() {
        let policy = policy();
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= prev, "delay decreased at attempt {}", attempt);
            assert!(delay <= policy.max_delay);
            prev = delay;
        }
        assert_eq!(policy.backoff_delay(19), policy.max_delay);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_hint_clamped() {
        let policy = policy();
        assert_eq!(policy.clamp_hint(Duration::from_secs(17)), Duration::from_secs(17));
        assert_eq!(policy.clamp_hint(Duration::from_secs(900)), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = policy();
        let base = Duration::from_secs(5);
        for _ in 0..100 {
            let jittered = policy.with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + policy.jitter);
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_attempts_remain() {
        let policy = policy();
        assert!(policy.attempts_remain(0));
        assert!(policy.attempts_remain(4));
        assert!(!policy.attempts_remain(5));
    }
}
