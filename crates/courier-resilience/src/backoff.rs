//! Retry backoff policies
//!
//! Two interchangeable strategies produce a bounded sequence of retry delays:
//!
//! - **Fixed**: the same interval before every retry
//! - **Exponential**: `min(initial * multiplier^(n-1), max_interval)` for retry `n`
//!
//! Both stop after `max_retries` retries. The sequence also ends once the next delay
//! would push the cumulative delay past `max_elapsed`, even if retries remain.

use courier_error::{CourierError, Result};
use rand::Rng;
use std::time::Duration;

/// Delay growth strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant delay
    Fixed,
    /// Geometric growth capped at `max_interval`
    Exponential,
}

/// Backoff policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay growth strategy
    pub strategy: BackoffStrategy,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Maximum delay cap
    pub max_interval: Duration,
    /// Multiplier for each retry (ignored for fixed)
    pub multiplier: f64,
    /// Maximum number of retries after the first attempt (`None` = bounded by time only)
    pub max_retries: Option<u32>,
    /// Ceiling on the cumulative delay
    pub max_elapsed: Option<Duration>,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl BackoffPolicy {
    /// Fixed delay between at most `max_retries` retries
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            max_retries: Some(max_retries),
            max_elapsed: None,
            jitter: 0.0,
        }
    }

    /// Exponential delay. The elapsed ceiling defaults to `max_interval * max_retries`.
    pub fn exponential(
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_interval,
            max_interval,
            multiplier,
            max_retries: Some(max_retries),
            max_elapsed: Some(max_interval.saturating_mul(max_retries)),
            jitter: 0.0,
        }
    }

    /// 1s doubling to 30s, five retries
    pub fn standard() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30), 2.0, 5)
    }

    /// Short, gently growing delays bounded by one minute in total
    pub fn high_priority() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
            max_retries: None,
            max_elapsed: Some(Duration::from_secs(60)),
            jitter: 0.0,
        }
    }

    /// Conservative policy for reprocessing dead letters: 5s, two retries
    pub fn dead_letter() -> Self {
        Self::fixed(Duration::from_secs(5), 2)
    }

    /// Set initial interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set maximum interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the cumulative delay ceiling
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay before retry `n` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.initial_interval,
            BackoffStrategy::Exponential => {
                let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let nanos = self.initial_interval.as_nanos() as f64 * self.multiplier.powi(exp);
                let cap = self.max_interval.as_nanos() as f64;
                if !nanos.is_finite() || nanos >= cap {
                    self.max_interval
                } else {
                    Duration::from_nanos(nanos.round() as u64)
                }
            }
        }
    }

    /// Iterator over the delays of a fresh retry sequence
    pub fn delays(&self) -> Backoff {
        Backoff::new(self.clone())
    }

    /// Check the policy's invariants
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval > self.max_interval {
            return Err(CourierError::Config(format!(
                "initial interval {:?} exceeds max interval {:?}",
                self.initial_interval, self.max_interval
            )));
        }
        if self.strategy == BackoffStrategy::Exponential && self.multiplier < 1.0 {
            return Err(CourierError::Config(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_retries.is_none() && self.max_elapsed.is_none() {
            return Err(CourierError::Config(
                "backoff needs max retries or max elapsed time".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stateful delay sequence produced by a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
    elapsed: Duration,
}

impl Backoff {
    /// Create a new backoff sequence
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            retries: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Sum of the delays handed out so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Reset the sequence
    pub fn reset(&mut self) {
        self.retries = 0;
        self.elapsed = Duration::ZERO;
    }

    fn delay_with_jitter(&self, base_delay: Duration) -> Duration {
        if self.policy.jitter <= 0.0 || base_delay.is_zero() {
            return base_delay;
        }

        let mut rng = rand::thread_rng();
        let jitter_range = base_delay.as_secs_f64() * self.policy.jitter;
        let jitter = rng.gen_range(-jitter_range..jitter_range);
        let jittered = Duration::from_secs_f64((base_delay.as_secs_f64() + jitter).max(0.0));

        jittered.min(self.policy.max_interval)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max) = self.policy.max_retries {
            if self.retries >= max {
                return None;
            }
        }

        let delay = self.delay_with_jitter(self.policy.delay_for(self.retries + 1));

        if let Some(limit) = self.policy.max_elapsed {
            if self.elapsed + delay > limit {
                return None;
            }
        }

        self.retries += 1;
        self.elapsed += delay;
        Some(delay)
    }
}
