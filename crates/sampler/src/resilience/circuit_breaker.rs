//! Connection circuit breaker
//!
//! A single explicit state machine that owns failure counting and backoff
//! timing for one streaming session. It never sleeps or touches the
//! network itself; the caller asks [`ConnectionBreaker::check`] before each
//! connection-level operation and reports the outcome back.

use super::backoff::ExponentialBackoff;
use crate::kafka::config::duration_millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Stop the session the first time the circuit opens
    #[serde(default)]
    pub terminate_on_open: bool,
}

fn default_failure_threshold() -> u32 {
    100
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            terminate_on_open: false,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("backoff base delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err(format!(
                "backoff max delay ({:?}) must not be below base delay ({:?})",
                self.max_delay, self.base_delay
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter must be in [0, 1], got {}", self.jitter));
        }
        Ok(())
    }
}

/// Circuit states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Connection attempts are short-circuited until `delay` has elapsed
    Open { opened_at: Instant, delay: Duration },
    /// One trial attempt is allowed
    HalfOpen,
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, CircuitState::HalfOpen)
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// What the caller may do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Closed: operate normally
    Proceed,
    /// HalfOpen: make exactly one attempt and report it
    Trial,
    /// Open: do not touch the connection for this long
    Wait(Duration),
}

/// Result of reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still closed; pause this long before retrying
    Retry(Duration),
    /// The circuit opened with this backoff delay
    Opened(Duration),
    /// The circuit opened and the session must stop
    Fatal,
}

/// Breaker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub open_count: u64,
    pub close_count: u64,
    /// Backoff exponent for the next `Open` entry
    pub attempt: u32,
}

/// Circuit breaker governing reconnects of one streaming session
#[derive(Debug)]
pub struct ConnectionBreaker {
    config: BreakerConfig,
    backoff: ExponentialBackoff,
    state: CircuitState,
    consecutive_failures: u32,
    attempt: u32,
    total_failures: u64,
    open_count: u64,
    close_count: u64,
}

impl ConnectionBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        info!(
            "Creating connection breaker: failure_threshold={}, base_delay={:?}, max_delay={:?}",
            config.failure_threshold, config.base_delay, config.max_delay
        );
        let backoff = ExponentialBackoff::new(config.base_delay, config.max_delay, config.jitter);
        Self {
            config,
            backoff,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            attempt: 0,
            total_failures: 0,
            open_count: 0,
            close_count: 0,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            open_count: self.open_count,
            close_count: self.close_count,
            attempt: self.attempt,
        }
    }

    /// Decide whether a connection-level operation may run now.
    ///
    /// Moves `Open` to `HalfOpen` once the backoff delay has elapsed.
    pub fn check(&mut self) -> Gate {
        match self.state {
            CircuitState::Closed => Gate::Proceed,
            CircuitState::HalfOpen => Gate::Trial,
            CircuitState::Open { opened_at, delay } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= delay {
                    info!("Connection breaker half-open: allowing one trial attempt");
                    self.state = CircuitState::HalfOpen;
                    Gate::Trial
                } else {
                    Gate::Wait(delay - elapsed)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if !self.state.is_closed() {
            info!(
                "Connection breaker closing after {} open period(s)",
                self.attempt
            );
            self.state = CircuitState::Closed;
            self.attempt = 0;
            self.close_count += 1;
        }
    }

    pub fn record_failure(&mut self) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures < self.config.failure_threshold {
                    debug!(
                        "Connection failure {}/{}",
                        self.consecutive_failures, self.config.failure_threshold
                    );
                    return FailureOutcome::Retry(self.config.base_delay);
                }

                let delay = self.open();
                if self.config.terminate_on_open && self.open_count == 1 {
                    warn!(
                        "Connection breaker opened after {} consecutive failures; terminating",
                        self.consecutive_failures
                    );
                    return FailureOutcome::Fatal;
                }
                FailureOutcome::Opened(delay)
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                FailureOutcome::Opened(self.open())
            }
        }
    }

    fn open(&mut self) -> Duration {
        let delay = self.backoff.delay(self.attempt);
        warn!(
            "Connection breaker open: {} consecutive failures, retrying in {:?}",
            self.consecutive_failures, delay
        );
        self.attempt = self.attempt.saturating_add(1);
        self.open_count += 1;
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
            delay,
        };
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            terminate_on_open: false,
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = ConnectionBreaker::new(config(3));
        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Retry(Duration::from_millis(100))
        );
        assert!(breaker.state().is_closed());

        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Opened(Duration::from_millis(100))
        );
        assert!(breaker.state().is_open());
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_resets_closed_counter() {
        let mut breaker = ConnectionBreaker::new(config(3));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.state().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_delay() {
        let mut breaker = ConnectionBreaker::new(config(1));
        breaker.record_failure();

        match breaker.check() {
            Gate::Wait(d) => assert_eq!(d, Duration::from_millis(100)),
            other => panic!("expected wait, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(breaker.check(), Gate::Trial);
        assert!(breaker.state().is_half_open());
        // stays half-open until the trial is reported
        assert_eq!(breaker.check(), Gate::Trial);

        breaker.record_success();
        assert!(breaker.state().is_closed());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.stats().attempt, 0);
        assert_eq!(breaker.check(), Gate::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_advances_backoff() {
        let mut breaker = ConnectionBreaker::new(config(1));
        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Opened(Duration::from_millis(100))
        );

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(breaker.check(), Gate::Trial);
        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Opened(Duration::from_millis(200))
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(breaker.check(), Gate::Trial);
        assert_eq!(
            breaker.record_failure(),
            FailureOutcome::Opened(Duration::from_millis(400))
        );
        assert_eq!(breaker.stats().open_count, 3);
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let mut breaker = ConnectionBreaker::new(config(1));
        let mut last = FailureOutcome::Fatal;
        for _ in 0..10 {
            last = breaker.record_failure();
        }
        assert_eq!(last, FailureOutcome::Opened(Duration::from_secs(1)));
    }

    #[test]
    fn test_terminate_on_first_open() {
        let mut breaker = ConnectionBreaker::new(BreakerConfig {
            terminate_on_open: true,
            ..config(2)
        });
        assert!(matches!(breaker.record_failure(), FailureOutcome::Retry(_)));
        assert_eq!(breaker.record_failure(), FailureOutcome::Fatal);
        assert!(breaker.state().is_open());
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());
        assert!(config(0).validate().is_err());
        assert!(BreakerConfig {
            jitter: 1.5,
            ..BreakerConfig::default()
        }
        .validate()
        .is_err());
        assert!(BreakerConfig {
            max_delay: Duration::from_millis(10),
            ..BreakerConfig::default()
        }
        .validate()
        .is_err());
    }
}
