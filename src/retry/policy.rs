//! Retry and reconnect policies
//!
//! Policies are validated once, when they are built or deserialised. Code that
//! holds a [`RetryPolicy`] or [`ReconnectPolicy`] never re-checks it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Policy validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("max_attempts must be greater than 0")]
    ZeroAttempts,
    #[error("base_delay must be greater than 0")]
    ZeroBaseDelay,
    #[error("max_delay must be greater than 0")]
    ZeroMaxDelay,
    #[error("base_delay {base:?} exceeds max_delay {max:?}")]
    BaseExceedsMax { base: Duration, max: Duration },
    #[error("multiplier must be a finite number >= 1, got {0}")]
    InvalidMultiplier(f64),
}

fn validate_backoff(base: Duration, max: Duration, multiplier: f64) -> Result<(), PolicyError> {
    if base.is_zero() {
        return Err(PolicyError::ZeroBaseDelay);
    }
    if max.is_zero() {
        return Err(PolicyError::ZeroMaxDelay);
    }
    if base > max {
        return Err(PolicyError::BaseExceedsMax { base, max });
    }
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(PolicyError::InvalidMultiplier(multiplier));
    }
    Ok(())
}

/// Exponential backoff state with optional jitter.
///
/// Each call to [`Backoff::next_delay`] returns `min(current + jitter, max)`
/// where `jitter` is uniform in `[0, current * (multiplier - 1))`, then grows
/// `current` by `multiplier`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            base,
            max,
            multiplier,
            jitter,
            current: base,
        }
    }

    /// Delay before the next attempt. Jittered delays fall in
    /// `[current, current * multiplier)`, never past the next nominal delay.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.current;
        let jitter = if self.jitter {
            random_below(scale(current, self.multiplier - 1.0, self.max))
        } else {
            Duration::ZERO
        };

        self.current = scale(current, self.multiplier, self.max);
        (current + jitter).min(self.max)
    }

    /// Start again from the base delay
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

fn scale(duration: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor)
        .unwrap_or(cap)
        .min(cap)
}

// An empty range would panic inside `random_range`, so a zero spread
// (multiplier of exactly 1) yields no jitter.
fn random_below(spread: Duration) -> Duration {
    let nanos = u64::try_from(spread.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

/// Bounded retry policy used by the publisher and the consumer workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetrySettings", into = "RetrySettings")]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, PolicyError> {
        Self::builder()
            .max_attempts(max_attempts)
            .base_delay(base_delay)
            .max_delay(max_delay)
            .multiplier(multiplier)
            .build()
    }

    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.multiplier, self.jitter)
    }

    /// Lower and upper bound of the total time spent sleeping when every
    /// attempt fails.
    pub fn sleep_envelope(&self) -> (Duration, Duration) {
        let mut lower = Duration::ZERO;
        let mut upper = Duration::ZERO;
        let mut current = self.base_delay;

        for _ in 1..self.max_attempts {
            lower += current.min(self.max_delay);
            upper += if self.jitter {
                scale(current, self.multiplier, self.max_delay)
            } else {
                current.min(self.max_delay)
            };
            current = scale(current, self.multiplier, self.max_delay);
        }

        (lower, upper)
    }
}

/// Builder for [`RetryPolicy`]; unset fields take the defaults
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        };

        if policy.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        validate_backoff(policy.base_delay, policy.max_delay, policy.multiplier)?;
        Ok(policy)
    }
}

/// On-disk form of a [`RetryPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    10
}

fn default_retry_max_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl TryFrom<RetrySettings> for RetryPolicy {
    type Error = PolicyError;

    fn try_from(settings: RetrySettings) -> Result<Self, Self::Error> {
        RetryPolicy::builder()
            .max_attempts(settings.max_attempts)
            .base_delay(Duration::from_millis(settings.base_delay_ms))
            .max_delay(Duration::from_millis(settings.max_delay_ms))
            .multiplier(settings.multiplier)
            .jitter(settings.jitter)
            .build()
    }
}

impl From<RetryPolicy> for RetrySettings {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

/// Unbounded backoff used between connection attempts and consume restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReconnectSettings", into = "ReconnectSettings")]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: bool,
    ) -> Result<Self, PolicyError> {
        validate_backoff(base_delay, max_delay, multiplier)?;
        Ok(Self {
            base_delay,
            max_delay,
            multiplier,
            jitter,
        })
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.multiplier, self.jitter)
    }
}

/// On-disk form of a [`ReconnectPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_reconnect_base_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl TryFrom<ReconnectSettings> for ReconnectPolicy {
    type Error = PolicyError;

    fn try_from(settings: ReconnectSettings) -> Result<Self, Self::Error> {
        ReconnectPolicy::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.multiplier,
            settings.jitter,
        )
    }
}

impl From<ReconnectPolicy> for ReconnectSettings {
    fn from(policy: ReconnectPolicy) -> Self {
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}
