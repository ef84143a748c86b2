use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSettings;

/// Reconnect backoff: exponential doubling from the configured base,
/// capped at the ceiling, with additive random jitter. Exhausted after the
/// configured number of consecutive failures.
pub(crate) struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    /// Registers a failure and returns how long to wait before the next
    /// attempt.
    pub(crate) fn next(&mut self) -> Duration {
        self.attempt += 1;
        let exp = (self.attempt - 1).min(31);
        let base = self
            .settings
            .base_ms
            .saturating_mul(1u64 << exp)
            .min(self.settings.ceiling_ms);

        let jitter = if self.settings.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.settings.jitter_ms)
        } else {
            0
        };

        Duration::from_millis(base + jitter)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.attempt >= self.settings.max_attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_ms: u64, ceiling_ms: u64, max_attempts: u32) -> BackoffSettings {
        BackoffSettings {
            base_ms,
            ceiling_ms,
            jitter_ms: 0,
            max_attempts,
        }
    }

    #[test]
    fn delay_strictly_increases_until_the_ceiling() {
        let mut backoff = Backoff::new(settings(1_000, 60_000, 10));

        let mut prev = Duration::ZERO;
        for _ in 0..6 {
            let next = backoff.next();
            assert!(next > prev, "expected {:?} > {:?}", next, prev);
            prev = next;
        }
        // 1s * 2^6 = 64s is past the ceiling.
        assert_eq!(backoff.next(), Duration::from_millis(60_000));
        assert_eq!(backoff.next(), Duration::from_millis(60_000));
    }

    #[test]
    fn exhausts_after_configured_attempts() {
        let mut backoff = Backoff::new(settings(10, 100, 3));
        assert!(!backoff.is_exhausted());

        for _ in 0..3 {
            backoff.next();
        }
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut backoff = Backoff::new(settings(10, 1_000, 3));
        backoff.next();
        backoff.next();
        backoff.reset();

        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(BackoffSettings {
            base_ms: 100,
            ceiling_ms: 1_000,
            jitter_ms: 50,
            max_attempts: 5,
        });

        for _ in 0..20 {
            backoff.reset();
            let d = backoff.next().as_millis() as u64;
            assert!((100..=150).contains(&d), "delay {} outside bounds", d);
        }
    }
}
