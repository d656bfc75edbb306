//! Circuit Breaker Implementation
//!
//! Per-instance failure isolator with three states: Closed (normal
//! operation), Open (fast-fail), and HalfOpen (trial). One breaker exists per
//! registered instance for its whole lifetime and is destroyed together with
//! the registry entry; a breaker opening never affects sibling breakers.
//!
//! ## Transitions
//! - Closed: failures increment a counter; reaching `failure_threshold` opens
//!   the circuit and records the timestamp.
//! - Open: calls fail immediately with `CircuitOpen` until `open_timeout` has
//!   elapsed, then the next call moves the breaker to HalfOpen.
//! - HalfOpen: exactly one trial call is admitted. Trial success closes the
//!   breaker and resets the failure count; trial failure reopens it with a
//!   fresh timestamp.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::error::{BalancerError, BalancerResult};

/// Circuit breaker state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation; tracks consecutive failures.
    Closed { failure_count: u32 },

    /// Fast-fail; records when the circuit opened.
    Open { opened_at: Instant },

    /// Trial state; `probe_in_flight` is set once the single trial call has
    /// been admitted.
    HalfOpen { probe_in_flight: bool },
}

impl CircuitState {
    /// Short label for logs and fleet stats.
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half-open",
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long the circuit stays open before admitting a trial call.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Lock-free counters for breaker activity, readable without touching the
/// state mutex.
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted through the breaker.
    pub admitted: AtomicU64,

    /// Calls rejected while the circuit was open.
    pub rejected: AtomicU64,

    /// Times the circuit has opened.
    pub opened_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            opened_count: self.opened_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of breaker counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub opened_count: u64,
}

/// Per-instance circuit breaker.
pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    config: CircuitBreakerConfig,
    metrics: CircuitBreakerMetrics,

    /// Id of the instance this breaker guards.
    server_id: String,
}

impl CircuitBreaker {
    /// Create a closed breaker for the given instance.
    pub fn new(server_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed { failure_count: 0 }),
            config,
            metrics: CircuitBreakerMetrics::default(),
            server_id: server_id.into(),
        }
    }

    /// Check whether a call may proceed, performing any due state transition.
    ///
    /// Returns `Err(CircuitOpen)` while the circuit is open and while a
    /// half-open trial is already in flight.
    pub fn can_proceed(&self) -> BalancerResult<()> {
        let mut state = self.state.lock();

        match *state {
            CircuitState::Closed { .. } => {
                self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_timeout {
                    // Timeout elapsed: this call becomes the half-open trial.
                    *state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        server_id = %self.server_id,
                        "circuit breaker half-open, admitting trial call"
                    );
                    Ok(())
                } else {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(BalancerError::circuit_open(&self.server_id))
                }
            }
            CircuitState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(BalancerError::circuit_open(&self.server_id))
                } else {
                    *state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();

        match *state {
            CircuitState::Closed { failure_count } if failure_count > 0 => {
                *state = CircuitState::Closed { failure_count: 0 };
            }
            CircuitState::Closed { .. } => {}
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Closed { failure_count: 0 };
                tracing::info!(
                    server_id = %self.server_id,
                    "circuit breaker closed after successful trial"
                );
            }
            // A success report while open can only be a stale completion from
            // before the circuit opened; the open timestamp stands.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();

        match *state {
            CircuitState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= self.config.failure_threshold {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        server_id = %self.server_id,
                        failures = failure_count,
                        "circuit breaker opened"
                    );
                } else {
                    *state = CircuitState::Closed { failure_count };
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    server_id = %self.server_id,
                    "circuit breaker reopened after failed trial"
                );
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Current state of the breaker.
    pub fn state(&self) -> CircuitState {
        self.state.lock().clone()
    }

    /// Id of the guarded instance.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u32, open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout,
            },
        )
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(matches!(
            cb.state(),
            CircuitState::Closed { failure_count: 0 }
        ));
        assert!(cb.can_proceed().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(cb.can_proceed().is_ok());
            cb.record_failure();
        }
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        // Fourth call is rejected without executing.
        assert!(matches!(
            cb.can_proceed(),
            Err(BalancerError::CircuitOpen { .. })
        ));
        assert_eq!(cb.metrics().rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Two failures after the reset: still closed.
        assert!(matches!(cb.state(), CircuitState::Closed { .. }));
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        thread::sleep(Duration::from_millis(80));

        // First call after the timeout is the trial.
        assert!(cb.can_proceed().is_ok());
        assert!(matches!(
            cb.state(),
            CircuitState::HalfOpen {
                probe_in_flight: true
            }
        ));

        // A second concurrent call is rejected while the trial is in flight.
        assert!(matches!(
            cb.can_proceed(),
            Err(BalancerError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_trial_success_closes() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));
        cb.can_proceed().unwrap();
        cb.record_success();
        assert!(matches!(
            cb.state(),
            CircuitState::Closed { failure_count: 0 }
        ));
        assert!(cb.can_proceed().is_ok());
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_timestamp() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));
        cb.can_proceed().unwrap();
        cb.record_failure();

        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        // Timestamp was refreshed, so the circuit is still rejecting.
        assert!(cb.can_proceed().is_err());
        assert_eq!(cb.metrics().opened_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_spec_sequence_threshold_three() {
        // Three consecutive failures open the circuit; an immediate fourth
        // call raises CircuitOpen without executing; after the open timeout
        // the next call is allowed and a success closes the breaker.
        let cb = breaker(3, Duration::from_millis(60));

        for _ in 0..3 {
            cb.can_proceed().unwrap();
            cb.record_failure();
        }
        assert!(cb.can_proceed().is_err());

        thread::sleep(Duration::from_millis(90));
        assert!(cb.can_proceed().is_ok());
        cb.record_success();
        assert!(matches!(
            cb.state(),
            CircuitState::Closed { failure_count: 0 }
        ));
    }
}
