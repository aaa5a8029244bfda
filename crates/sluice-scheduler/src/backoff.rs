//! Exponential backoff with jitter.

use sluice_core::pipeline::RetryConfig;
use std::time::Duration;

/// Retry delays doubling from `base` with up to 10% jitter, capped at
/// `ceiling`. Below the ceiling, each delay is strictly longer than the
/// previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Backoff for a stage's own retry policy, falling back to `default`
    /// for unset delays.
    pub fn for_retry(config: &RetryConfig, default: Backoff) -> Self {
        let base = config
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(default.base);
        let ceiling = config
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(default.ceiling);
        Self::new(base, ceiling)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        let multiplied = self.base.as_secs_f64() * 2f64.powi(exponent);
        let jitter = rand::random::<f64>() * multiplied * 0.1;
        let delay = Duration::from_secs_f64(multiplied + jitter);
        delay.min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_strictly_increase_below_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n)).collect();
            for pair in delays.windows(2) {
                assert!(pair[0] < pair[1], "{delays:?}");
            }
            assert!(delays[0] >= Duration::from_secs(1));
            assert!(delays[0] <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_delay_capped_at_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(20), Duration::from_secs(10));
    }

    #[test]
    fn test_stage_policy_overrides_default() {
        let default = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let policy = RetryConfig {
            max_retries: 2,
            delay_ms: Some(200),
            max_delay_ms: None,
        };
        let backoff = Backoff::for_retry(&policy, default);
        assert!(backoff.delay(1) < Duration::from_millis(250));
        assert_eq!(backoff.delay(30), Duration::from_secs(60));
    }
}
