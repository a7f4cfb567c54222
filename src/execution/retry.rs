//! Backoff between retry attempts.

use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Capped exponential backoff with proportional jitter.
///
/// The nominal delay before attempt `n + 1` (after `n` failures) is
/// `base_delay * multiplier^(n - 1)`, capped at `max_delay`. Jitter spreads
/// the result uniformly over `delay * (1 ± jitter)`, again capped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the nominal delay to randomize, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay at all.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// A fixed delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before the next attempt, given how many retries have already
    /// been scheduled (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let spread = nominal.as_secs_f64() * self.jitter;
        let low = (nominal.as_secs_f64() - spread).max(0.0);
        let high = nominal.as_secs_f64() + spread;
        let secs = rand::thread_rng().gen_range(low..=high);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// Delay without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.retry.jitter".to_string(),
                message: format!("{} is outside 0.0..=1.0", self.jitter),
            });
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.retry.multiplier".to_string(),
                message: format!("{} must be a finite value >= 1.0", self.multiplier),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.retry.base_delay".to_string(),
                message: "exceeds max_delay".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert!(policy.delay_for(1).is_zero());
        assert!(policy.delay_for(10).is_zero());
    }

    #[test]
    fn validate_rejects_bad_jitter() {
        let policy = RetryPolicy {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
