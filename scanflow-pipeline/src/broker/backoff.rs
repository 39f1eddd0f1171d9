//! Reconnect backoff policy
//!
//! Capped exponential backoff with symmetric jitter:
//! `delay(n) = min(base * multiplier^n, max) * U(1 - jitter, 1 + jitter)`,
//! never above `max`.

use rand::Rng;
use scanflow_common::config::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0.0 = deterministic, 1.0 = anywhere from zero to twice the delay
    pub jitter: f64,
    /// Consecutive failures before operators are alerted
    pub alert_after_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: 2.0,
            jitter: config.jitter.clamp(0.0, 1.0),
            alert_after_attempts: config.alert_after_attempts.max(1),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponential = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt.min(64) as i32);
        let delay = (exponential.min(max) * factor).clamp(0.0, max);
        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter,
            alert_after_attempts: 3,
        }
    }

    #[test]
    fn test_doubles_then_caps() {
        let p = policy(0.0);
        let delays: Vec<u128> = (0..6).map(|n| p.delay_for_attempt(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(0.5);
        for _ in 0..200 {
            let first = p.delay_for_attempt(0);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));

            let capped = p.delay_for_attempt(10);
            assert!(capped >= Duration::from_millis(500) && capped <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_from_config_clamps() {
        let config = ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 20,
            jitter: 3.0,
            alert_after_attempts: 0,
        };
        let p = ReconnectPolicy::from_config(&config);
        assert_eq!(p.jitter, 1.0);
        assert_eq!(p.alert_after_attempts, 1);
    }
}
