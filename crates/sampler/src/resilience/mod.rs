//! Connection resilience for the streaming session.
//!
//! [`ConnectionBreaker`] combines failure counting, the `Closed` /
//! `Open` / `HalfOpen` circuit and exponential backoff in one state
//! machine, so the session loop only has to ask [`ConnectionBreaker::check`]
//! and report outcomes.

mod backoff;
mod circuit_breaker;

pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{
    BreakerConfig, BreakerStats, CircuitState, ConnectionBreaker, FailureOutcome, Gate,
};
