//! # Error Handling Module
//!
//! This module defines the error taxonomy used throughout the balancer with the
//! `thiserror` crate. Every fallible operation in the crate returns
//! [`BalancerResult`], and callers can match on [`BalancerError`] variants to
//! distinguish routing exhaustion from transient per-instance failures.
//!
//! Propagation policy: transient per-instance failures (an open breaker, a
//! timed-out probe) are retried against different instances inside
//! `route_request`; only total exhaustion is surfaced. Health-check and scaling
//! failures are never fatal to the process: they are logged with instance id
//! and reason, and retried on the next natural cycle.

use thiserror::Error;

/// Main result type used throughout the balancer.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Error types produced by routing, health checking, and fleet scaling.
#[derive(Debug, Error, Clone)]
pub enum BalancerError {
    /// No healthy, non-isolated candidate is available for a request.
    #[error("no healthy servers available")]
    NoHealthyServers,

    /// The instance's circuit breaker is open; the request was rejected
    /// without being executed.
    #[error("circuit breaker open for server: {server}")]
    CircuitOpen { server: String },

    /// A bounded network operation (probe, provisioning call, store access)
    /// exceeded its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A scaling evaluation was rejected because another scaling operation is
    /// already in flight. Callers treat this as a skip, not a failure.
    #[error("a scaling operation is already in progress")]
    ScalingInProgress,

    /// The provisioning provider failed to add or remove an instance. Fleet
    /// state is left unchanged and the action is retried on the next cycle.
    #[error("provisioning failure: {message}")]
    Provisioning { message: String },

    /// A health probe against an instance failed. Recovered locally by marking
    /// the instance unhealthy; never surfaced to routing callers.
    #[error("health check failed for server {server}: {message}")]
    HealthCheck { server: String, message: String },

    /// The external system-metrics source failed or returned malformed data.
    /// Recovered locally by recording a fallback sample.
    #[error("metrics source unavailable: {message}")]
    MetricsUnavailable { message: String },

    /// The shared key-value store rejected or failed an operation.
    #[error("shared store error: {message}")]
    Store { message: String },

    /// An operation referenced a server id that is not registered.
    #[error("unknown server: {id}")]
    UnknownServer { id: String },

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl BalancerError {
    /// Create a circuit-open error for the given server.
    pub fn circuit_open(server: impl Into<String>) -> Self {
        Self::CircuitOpen {
            server: server.into(),
        }
    }

    /// Create a timeout error from a duration.
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a provisioning error with a custom message.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Create a health-check error for the given server.
    pub fn health_check(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HealthCheck {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a metrics-source error with a custom message.
    pub fn metrics_unavailable(message: impl Into<String>) -> Self {
        Self::MetricsUnavailable {
            message: message.into(),
        }
    }

    /// Create a store error with a custom message.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an unknown-server error.
    pub fn unknown_server(id: impl Into<String>) -> Self {
        Self::UnknownServer { id: id.into() }
    }

    /// Create a configuration error with a custom message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is transient for routing purposes: the router may
    /// retry against a different instance within the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::Timeout { .. } | Self::HealthCheck { .. }
        )
    }
}

impl From<redis::RedisError> for BalancerError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store {
            message: format!("serialization failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = BalancerError::circuit_open("srv-1");
        assert_eq!(err.to_string(), "circuit breaker open for server: srv-1");

        let err = BalancerError::timeout(std::time::Duration::from_secs(5));
        assert_eq!(err.to_string(), "operation timed out after 5000ms");

        assert_eq!(
            BalancerError::NoHealthyServers.to_string(),
            "no healthy servers available"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BalancerError::circuit_open("srv-1").is_retryable());
        assert!(BalancerError::timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!BalancerError::NoHealthyServers.is_retryable());
        assert!(!BalancerError::ScalingInProgress.is_retryable());
    }
}
