//! Exponential reconnect backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::LinkConfig;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub min: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Growth factor per attempt.
    pub factor: f64,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,

    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), 2.0)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max,
            factor,
            jitter: 0.1,
            attempt: 0,
        }
    }

    pub fn from_config(cfg: &LinkConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_min_ms),
            Duration::from_millis(cfg.backoff_max_ms),
            cfg.backoff_factor,
        )
    }

    /// Delay for the current attempt, advancing to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.min.as_millis() as f64 * self.factor.powi(self.attempt as i32);
        let capped = base.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.clamp(0.0, self.max.as_millis() as f64) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_until_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        backoff.jitter = 0.0;

        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        backoff.jitter = 0.0;
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(10), 1.0);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
