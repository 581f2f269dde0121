use std::time::Duration;

use crate::config::BackoffConfig;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.mul_f64(self.config.jitter).as_millis() as u64;
        let jitter = if spread == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..=spread))
        };
        (base + jitter).min(self.config.max)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config
            .initial
            .saturating_mul(1u32 << exponent)
            .min(self.config.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter,
        })
    }

    #[test]
    fn doubles_until_capped() {
        let b = backoff(0.0);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
        assert_eq!(b.delay(6), Duration::from_secs(2));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = backoff(0.5);
        for attempt in 1..10 {
            let base = b.base_delay(attempt);
            let delay = b.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= Duration::from_secs(2));
            assert!(delay <= base + base.mul_f64(0.5));
        }
    }
}
