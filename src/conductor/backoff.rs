//! Reconnect backoff: exponential, capped, jittered.

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first reconnect attempt (before jitter)
    pub base_delay: Duration,
    /// Cap on the exponential delay (before jitter)
    pub max_delay: Duration,
    /// Attempts before giving up and staying in `error`
    pub max_attempts: u32,
    /// Delay is scaled by a random factor in [1-jitter, 1+jitter]; 0 disables
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-indexed): `base * 2^attempt`, capped, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        capped.mul_f64(factor)
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exponential_ms.min(self.max_delay.as_millis() as u64))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter,
        }
    }

    #[test]
    fn test_exponential_and_capped() {
        let p = policy(0.0);
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(16_000));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(30_000));
        assert_eq!(p.delay_for_attempt(63), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = policy(0.3);
        for _ in 0..200 {
            let d = p.delay_for_attempt(2);
            assert!(d >= Duration::from_millis(2800) && d <= Duration::from_millis(5200), "{:?}", d);
        }
    }

    #[test]
    fn test_retry_bound() {
        let p = policy(0.0);
        assert!(p.should_retry(4));
        assert!(!p.should_retry(5));
        let disabled = ReconnectPolicy {
            enabled: false,
            ..p
        };
        assert!(!disabled.should_retry(0));
    }
}
