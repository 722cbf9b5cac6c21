//! Exponential backoff with multiplicative jitter

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::BackoffConfig;

/// Jitter multiplier range: [0.5, 1.5)
pub const JITTER_MIN: f64 = 0.5;
pub const JITTER_MAX: f64 = 1.5;

/// Backoff calculator with jitter for thundering herd prevention
#[derive(Debug)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    attempt: u32,
    rng: StdRng,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter source for tests and replays
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(config)
        }
    }

    /// Un-jittered delay for attempt `n` (1-based): min(max, base * 2^(n-1))
    pub fn expected_delay(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let grown = base_ms * 2f64.powi(exponent);
        let capped = grown.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Advance the attempt counter and return its jittered delay
    pub fn next(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let expected = self.expected_delay(self.attempt);
        let jitter = self.rng.gen_range(JITTER_MIN..JITTER_MAX);
        Duration::from_secs_f64(expected.as_secs_f64() * jitter)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
        }
    }

    #[test]
    fn test_expected_growth_with_ceiling() {
        let backoff = BackoffPolicy::with_seed(&config(100, 1_000), 7);
        assert_eq!(backoff.expected_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.expected_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.expected_delay(4), Duration::from_millis(800));
        assert_eq!(backoff.expected_delay(5), Duration::from_millis(1_000));
        assert_eq!(backoff.expected_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delays_within_jitter_bounds() {
        let mut backoff = BackoffPolicy::with_seed(&config(100, 30_000), 42);
        let mut previous_expected = Duration::ZERO;

        for n in 1..=25 {
            let delay = backoff.next();
            let expected = backoff.expected_delay(n);

            // Expected delays never shrink and stop at the ceiling
            assert!(expected >= previous_expected);
            assert!(expected <= Duration::from_millis(30_000));
            previous_expected = expected;

            let lo = expected.as_secs_f64() * JITTER_MIN;
            let hi = expected.as_secs_f64() * JITTER_MAX;
            let d = delay.as_secs_f64();
            assert!(d >= lo - 1e-9 && d <= hi, "attempt {n}: {d} not in [{lo}, {hi}]");
        }
        assert_eq!(backoff.attempt(), 25);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = BackoffPolicy::with_seed(&config(100, 30_000), 1);
        for _ in 0..5 {
            backoff.next();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);

        let d = backoff.next();
        assert_eq!(backoff.attempt(), 1);
        assert!(d >= Duration::from_millis(50) && d < Duration::from_millis(150));
    }

    #[test]
    fn test_jitter_never_zero() {
        let mut backoff = BackoffPolicy::with_seed(&config(10, 10), 99);
        for _ in 0..200 {
            assert!(backoff.next() >= Duration::from_millis(5));
        }
    }
}
