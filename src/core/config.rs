//! # Configuration Module
//!
//! Serde-backed configuration for every balancer component, with defaults
//! that match the documented behavior (30 s health interval, 5 s probe
//! timeout, 15 min prediction horizon, separate scale-up/scale-down
//! cooldowns). Durations are human-readable in YAML (`30s`, `15m`) via
//! `humantime-serde`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::balancing::strategies::StrategyKind;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::provision::InstanceRequest;

/// Top-level configuration for the balancer and its background loops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Selection strategy, fixed at router construction.
    pub strategy: StrategyKind,

    pub router: RouterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthCheckConfig,
    pub collector: CollectorConfig,
    pub predictor: PredictorConfig,
    pub scaler: ScalerConfig,
    pub store: StoreConfig,
}

impl BalancerConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> BalancerResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BalancerError::config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| BalancerError::config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> BalancerResult<()> {
        if self.scaler.min_instances == 0 {
            return Err(BalancerError::config("scaler.min_instances must be >= 1"));
        }
        if self.scaler.max_instances < self.scaler.min_instances {
            return Err(BalancerError::config(
                "scaler.max_instances must be >= scaler.min_instances",
            ));
        }
        if !(0.0..=1.0).contains(&self.scaler.target_cpu_utilization)
            || self.scaler.target_cpu_utilization == 0.0
        {
            return Err(BalancerError::config(
                "scaler.target_cpu_utilization must be in (0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.scaler.target_memory_utilization)
            || self.scaler.target_memory_utilization == 0.0
        {
            return Err(BalancerError::config(
                "scaler.target_memory_utilization must be in (0, 1]",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(BalancerError::config(
                "circuit_breaker.failure_threshold must be >= 1",
            ));
        }
        if self.collector.max_entries == 0 {
            return Err(BalancerError::config("collector.max_entries must be >= 1"));
        }
        Ok(())
    }
}

/// Router behavior: retry budget and session affinity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Additional attempts after the first candidate fails; the router makes
    /// at most `max_retries + 1` selections per request.
    pub max_retries: u32,

    /// Whether sticky sessions are honored and recorded.
    pub session_affinity: bool,

    /// TTL for sticky mappings in the shared store.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            session_affinity: true,
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Health checker probe loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Interval between probe sweeps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout; exceeding it marks the instance unhealthy.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Path appended to the instance URL for probes.
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            path: "/health".to_string(),
        }
    }
}

/// Metrics collector polling and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Interval between samples of the external metrics source.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Timeout for one source poll; a timed-out poll records a fallback
    /// sample instead.
    #[serde(with = "humantime_serde")]
    pub source_timeout: Duration,

    /// Age horizon of the sample window.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Hard cap on window entries, applied in addition to the age horizon.
    pub max_entries: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            source_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(24 * 60 * 60),
            // 24h of samples at the default 30s poll interval.
            max_entries: 2880,
        }
    }
}

/// Traffic predictor cohort selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Forecast horizon.
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,

    /// Half-width of the time-of-day cohort window.
    #[serde(with = "humantime_serde")]
    pub time_of_day_window: Duration,

    /// Number of recent samples used for the short-term trend adjustment.
    pub trend_samples: usize,

    /// Minimum history before cohort forecasting kicks in; below this the
    /// predictor passes through the latest observation.
    pub min_history: usize,

    /// History span after which the cohort is restricted to the same
    /// day-of-week.
    #[serde(with = "humantime_serde")]
    pub weekday_history: Duration,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(15 * 60),
            time_of_day_window: Duration::from_secs(60 * 60),
            trend_samples: 12,
            min_history: 10,
            weekday_history: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Fleet scaler bounds, targets, and hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub min_instances: u32,
    pub max_instances: u32,

    /// Target CPU utilization per instance, 0–1.
    pub target_cpu_utilization: f64,

    /// Target memory utilization per instance, 0–1.
    pub target_memory_utilization: f64,

    /// Minimum gap between two scale-up actions.
    #[serde(with = "humantime_serde")]
    pub scale_up_cooldown: Duration,

    /// Minimum gap between two scale-down actions.
    #[serde(with = "humantime_serde")]
    pub scale_down_cooldown: Duration,

    /// Interval of the background evaluation loop.
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,

    /// Maximum time a drain waits for in-flight work before forcing removal.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Template handed to the provisioning provider when growing the fleet.
    pub instance_template: InstanceRequest,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            target_cpu_utilization: 0.7,
            target_memory_utilization: 0.8,
            scale_up_cooldown: Duration::from_secs(180),
            scale_down_cooldown: Duration::from_secs(600),
            evaluation_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            instance_template: InstanceRequest::default(),
        }
    }
}

/// Shared key-value store connection and key layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,

    /// Prefix for every key written by this fleet.
    pub key_prefix: String,

    /// TTL for mirrored registry entries; refreshed on every mutation so
    /// stale entries age out after a process dies.
    #[serde(with = "humantime_serde")]
    pub mirror_ttl: Duration,

    /// Timeout for individual store operations.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "fleet:".to_string(),
            mirror_ttl: Duration::from_secs(5 * 60),
            operation_timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BalancerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let mut config = BalancerConfig::default();
        config.scaler.min_instances = 5;
        config.scaler.max_instances = 2;
        assert!(matches!(
            config.validate(),
            Err(BalancerError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_zero_cpu_target() {
        let mut config = BalancerConfig::default();
        config.scaler.target_cpu_utilization = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_with_humantime_durations() {
        let yaml = r#"
strategy: least-connections
health:
  interval: 10s
  probe_timeout: 2s
  path: /healthz
scaler:
  min_instances: 2
  max_instances: 8
  scale_up_cooldown: 3m
"#;
        let config: BalancerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.strategy, StrategyKind::LeastConnections);
        assert_eq!(config.health.interval, Duration::from_secs(10));
        assert_eq!(config.health.path, "/healthz");
        assert_eq!(config.scaler.min_instances, 2);
        assert_eq!(config.scaler.scale_up_cooldown, Duration::from_secs(180));
        // Untouched sections keep their defaults.
        assert_eq!(config.router.max_retries, 2);
        assert!(config.validate().is_ok());
    }
}
