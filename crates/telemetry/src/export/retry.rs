//! Bounded exponential backoff for exporter delivery.

use std::time::Duration;

use llmscope_config::ExportConfig;
use rand::Rng;

/// How often, and how patiently, a batch is re-offered to an exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_coefficient: f64,
    /// Fraction of the delay added or removed at random (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            ..Self::default()
        }
    }

    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt number `attempt` (1-based). Zero for the first.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry = (attempt - 2).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.backoff_coefficient.powi(retry);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let spread = capped * self.jitter;
        let delay = if spread > 0.0 {
            (capped + rand::rng().random_range(-spread..spread)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.delay_for_attempt(2).as_secs_f64();
            assert!((0.05..=0.15).contains(&d), "delay {d}");
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
        assert!(!RetryPolicy::no_retry().has_attempts_remaining(1));
    }

    #[test]
    fn built_from_export_config() {
        let config = ExportConfig {
            max_attempts: 5,
            initial_backoff_ms: 20,
            max_backoff_ms: 80,
            ..ExportConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(20));
        assert_eq!(policy.max_backoff, Duration::from_millis(80));
    }
}
