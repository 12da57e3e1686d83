//! Capped exponential backoff

use std::time::Duration;

use super::config::ReconcilerConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self::new(
            config.retry_base_delay(),
            config.retry_max_delay(),
            config.retry_max_attempts,
        )
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based): `min(base * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base
            .checked_mul(multiplier)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 6);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 100);
        assert_eq!(backoff.delay_for(90), Duration::from_secs(5));
    }
}
