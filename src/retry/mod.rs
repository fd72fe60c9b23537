//! Retry policies and the bounded retry executor

pub mod executor;
pub mod policy;

pub use executor::{interruptible_sleep, RetryError, RetryExecutor};
pub use policy::{
    Backoff, PolicyError, ReconnectPolicy, ReconnectSettings, RetryPolicy, RetryPolicyBuilder,
    RetrySettings,
};
