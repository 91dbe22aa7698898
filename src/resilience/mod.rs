//! Resilience middleware composed around node invocations
//!
//! - [`retry`]: exponential backoff with jitter for retryable failures
//! - [`breaker`]: per-dependency circuit breakers shared across executions
//!
//! The executor acquires the breaker inside each retry attempt, so an attempt
//! that meets an open breaker fails fast instead of sleeping and retrying
//! against a dependency already known to be down.

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerPermit, BreakerRegistry, BreakerRejection, BreakerState,
    CircuitBreaker, StateChangeCallback,
};
pub use retry::{retry, RetryOutcome, RetryPolicy};
