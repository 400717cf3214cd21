//! Exponential backoff schedule
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Add random jitter to each delay (±30%, still capped at `max`)
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given zero-based attempt: `initial * multiplier^attempt`, capped at `max`.
    ///
    /// Without jitter the schedule is strictly increasing until it reaches `max`
    /// (as long as `initial > 0` and `multiplier > 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap_ms = self.max.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw_ms = self.initial.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);

        let base_ms = if raw_ms.is_finite() {
            raw_ms.min(cap_ms)
        } else {
            cap_ms
        };

        let delay_ms = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            (base_ms * jitter_factor).min(cap_ms)
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Stateful walk over a [`BackoffConfig`] schedule.
///
/// Each call to [`Backoff::next_delay`] returns the next wait and advances the
/// failure count; [`Backoff::reset`] starts over after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let config = config(100, 1_000);

        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(4), Duration::from_millis(1_000)); // capped
        assert_eq!(config.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let config = config(1_000, 60_000);
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn test_strictly_increasing_below_cap() {
        let config = config(50, 100_000);
        let delays: Vec<_> = (0..8).map(|n| config.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter: true,
            ..config(1_000, 1_200)
        };

        for _ in 0..100 {
            let delay = config.delay_for(0);
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(config(10, 1_000));

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
