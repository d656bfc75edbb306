//! # Core Types Module
//!
//! Foundational data structures shared by the registry, router, health
//! checker, and fleet scaler: backend instance state, request context,
//! metric samples, and scaling decisions.
//!
//! ## Concurrency model
//!
//! A [`ServerInstance`] is shared behind an `Arc` between the router hot path,
//! the health checker, and the scaler. All live counters (`current_load`,
//! `connections`) and the health flag are per-instance atomics, so the admit
//! and release paths never take a registry-wide lock. The smoothed response
//! time and the cpu/memory gauges are stored as f64 bit patterns in
//! `AtomicU64`; they are advisory signals, and relaxed ordering is sufficient.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Smoothing factor for the response-time EWMA. Recent samples carry 30% of
/// the new value.
const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.3;

/// Specification for a backend instance, supplied on registration or produced
/// by the provisioning provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique instance identifier; generated when omitted.
    pub id: Option<String>,

    /// Base URL of the backend (e.g. `http://10.0.1.12:8080`).
    pub url: String,

    /// Deployment region used by the geographic strategy.
    pub region: String,

    /// Integer throughput budget; feeds the weighted strategy.
    pub capacity: u32,

    /// Opaque key-value metadata attached at creation.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServerSpec {
    /// Create a spec with a generated id and empty metadata.
    pub fn new(url: impl Into<String>, region: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: None,
            url: url.into(),
            region: region.into(),
            capacity,
            metadata: HashMap::new(),
        }
    }

    /// Create a spec with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        url: impl Into<String>,
        region: impl Into<String>,
        capacity: u32,
    ) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(url, region, capacity)
        }
    }
}

/// A registered backend instance with live, atomically updated state.
///
/// `healthy` is mutated only by the health checker and by drain start, never
/// directly by the router. `current_load` and `connections` change only via
/// router admission and the caller's completion callback, and can never go
/// negative (release is saturating).
pub struct ServerInstance {
    /// Unique instance identifier.
    pub id: String,

    /// Base URL of the backend.
    pub url: String,

    /// Deployment region.
    pub region: String,

    /// Integer throughput budget.
    pub capacity: u32,

    /// Opaque metadata, fixed at creation.
    pub metadata: HashMap<String, String>,

    current_load: AtomicU32,
    connections: AtomicU32,
    healthy: AtomicBool,
    last_health_check: RwLock<Option<Instant>>,

    /// EWMA of observed response times, f64 bits. Zero means "no observation
    /// yet" and the first sample is taken verbatim.
    response_time_ms: AtomicU64,

    cpu: AtomicU64,
    memory: AtomicU64,
}

impl ServerInstance {
    /// Create a new instance from a spec: healthy, with zeroed counters.
    pub fn from_spec(spec: ServerSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            url: spec.url,
            region: spec.region,
            capacity: spec.capacity,
            metadata: spec.metadata,
            current_load: AtomicU32::new(0),
            connections: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            last_health_check: RwLock::new(None),
            response_time_ms: AtomicU64::new(0),
            cpu: AtomicU64::new(0),
            memory: AtomicU64::new(0),
        }
    }

    /// Admit one request: increments load and connection counters.
    pub fn admit(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one request after the caller reports completion. Saturating:
    /// a spurious release never drives a counter negative.
    pub fn release(&self) {
        let _ = self
            .current_load
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Overwrite the connection counter from an external metrics push.
    pub fn set_connections(&self, connections: u32) {
        self.connections.store(connections, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set the health flag, returning the previous value so callers can detect
    /// a flip. Reserved for the health checker and drain start.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    /// Record when the instance was last probed.
    pub fn touch_health_check(&self) {
        *self.last_health_check.write() = Some(Instant::now());
    }

    /// Time since the last probe, if any.
    pub fn last_health_check_age(&self) -> Option<Duration> {
        self.last_health_check.read().map(|at| at.elapsed())
    }

    /// Fold a new response-time observation into the EWMA.
    pub fn observe_response_time(&self, sample_ms: f64) {
        let prev = f64::from_bits(self.response_time_ms.load(Ordering::Relaxed));
        let next = if prev == 0.0 {
            sample_ms
        } else {
            RESPONSE_TIME_EWMA_ALPHA * sample_ms + (1.0 - RESPONSE_TIME_EWMA_ALPHA) * prev
        };
        self.response_time_ms
            .store(next.to_bits(), Ordering::Relaxed);
    }

    /// Smoothed response time in milliseconds; zero until first observation.
    pub fn response_time_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ms.load(Ordering::Relaxed))
    }

    pub fn cpu(&self) -> f64 {
        f64::from_bits(self.cpu.load(Ordering::Relaxed))
    }

    pub fn memory(&self) -> f64 {
        f64::from_bits(self.memory.load(Ordering::Relaxed))
    }

    /// Update the cpu gauge, clamped to the 0–1 range.
    pub fn set_cpu(&self, cpu: f64) {
        self.cpu
            .store(cpu.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Update the memory gauge, clamped to the 0–1 range.
    pub fn set_memory(&self, memory: f64) {
        self.memory
            .store(memory.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Effective weight for the weighted strategy: remaining capacity, floored
    /// at 1 so a saturated instance is never fully starved.
    pub fn effective_weight(&self) -> u32 {
        self.capacity.saturating_sub(self.current_load()).max(1)
    }

    /// Immutable copy of the instance state for strategies and reporting.
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            region: self.region.clone(),
            capacity: self.capacity,
            current_load: self.current_load(),
            connections: self.connections(),
            healthy: self.is_healthy(),
            response_time_ms: self.response_time_ms(),
            cpu: self.cpu(),
            memory: self.memory(),
            last_health_check_age_ms: self
                .last_health_check_age()
                .map(|age| age.as_millis() as u64),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("region", &self.region)
            .field("capacity", &self.capacity)
            .field("current_load", &self.current_load())
            .field("connections", &self.connections())
            .field("healthy", &self.is_healthy())
            .field("response_time_ms", &self.response_time_ms())
            .finish()
    }
}

/// Immutable, serializable copy of a [`ServerInstance`], used for the shared
/// store mirror and fleet stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub url: String,
    pub region: String,
    pub capacity: u32,
    pub current_load: u32,
    pub connections: u32,
    pub healthy: bool,
    pub response_time_ms: f64,
    pub cpu: f64,
    pub memory: f64,
    pub last_health_check_age_ms: Option<u64>,
    pub metadata: HashMap<String, String>,
}

/// Partial metrics update merged into an instance by
/// `ServerRegistry::update_server_metrics`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMetricsUpdate {
    /// CPU gauge, 0–1.
    pub cpu: Option<f64>,
    /// Memory gauge, 0–1.
    pub memory: Option<f64>,
    /// Absolute connection count reported by the backend.
    pub connections: Option<u32>,
    /// A response-time observation folded into the EWMA.
    pub response_time_ms: Option<f64>,
}

/// Per-request context consumed by the router and the selection strategies.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique id for tracing and logging.
    pub request_id: String,

    /// Client address; drives the IP-hash strategy.
    pub client_ip: IpAddr,

    /// Session identifier carried by the request, if any. Enables the sticky
    /// fast path when session affinity is configured.
    pub session_id: Option<String>,

    /// Preferred region for the geographic strategy.
    pub region: Option<String>,
}

impl RequestContext {
    /// Create a context with a generated request id.
    pub fn new(client_ip: IpAddr) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_ip,
            session_id: None,
            region: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// One load observation appended to the bounded metrics window.
///
/// Fields are clamped to valid ranges at ingestion; gauges and rates outside
/// their domain indicate a misbehaving source, not data to store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    /// System CPU load, 0–1.
    pub cpu_load: f64,
    /// System memory usage, 0–1.
    pub memory_usage: f64,
    /// Fleet-wide active connections.
    pub active_connections: u32,
    /// Requests per second.
    pub request_rate: f64,
    /// Error ratio, 0–1.
    pub error_rate: f64,
    /// Mean response time in milliseconds.
    pub response_time_ms: f64,
}

impl MetricSample {
    /// A neutral sample used when the metrics source is unavailable.
    pub fn fallback(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_load: 0.0,
            memory_usage: 0.0,
            active_connections: 0,
            request_rate: 0.0,
            error_rate: 0.0,
            response_time_ms: 0.0,
        }
    }

    /// Clamp every field to its valid range.
    pub fn clamped(mut self) -> Self {
        self.cpu_load = self.cpu_load.clamp(0.0, 1.0);
        self.memory_usage = self.memory_usage.clamp(0.0, 1.0);
        self.error_rate = self.error_rate.clamp(0.0, 1.0);
        self.request_rate = self.request_rate.max(0.0);
        self.response_time_ms = self.response_time_ms.max(0.0);
        self
    }
}

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    #[serde(rename = "none")]
    NoChange,
}

/// Result of one scaling evaluation. Produced fresh on every cycle and never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub current_instances: u32,
    pub optimal_instances: u32,
    pub action: ScalingAction,
    /// Remaining cooldown when the action was suppressed by hysteresis.
    #[serde(default, with = "humantime_serde")]
    pub cooldown_remaining: Option<Duration>,
    pub reason: String,
}

impl ScalingDecision {
    /// A no-op decision with the given reason.
    pub fn no_change(current: u32, reason: impl Into<String>) -> Self {
        Self {
            current_instances: current,
            optimal_instances: current,
            action: ScalingAction::NoChange,
            cooldown_remaining: None,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_never_goes_negative() {
        let server = ServerInstance::from_spec(ServerSpec::new("http://a", "us-east", 10));
        server.admit();
        server.release();
        server.release();
        assert_eq!(server.current_load(), 0);
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn test_response_time_ewma_first_sample_verbatim() {
        let server = ServerInstance::from_spec(ServerSpec::new("http://a", "us-east", 10));
        server.observe_response_time(100.0);
        assert_eq!(server.response_time_ms(), 100.0);

        server.observe_response_time(200.0);
        // 0.3 * 200 + 0.7 * 100
        assert!((server.response_time_ms() - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_effective_weight_floors_at_one() {
        let server = ServerInstance::from_spec(ServerSpec::new("http://a", "us-east", 2));
        assert_eq!(server.effective_weight(), 2);
        server.admit();
        server.admit();
        assert_eq!(server.effective_weight(), 1);
        server.admit();
        assert_eq!(server.effective_weight(), 1);
    }

    #[test]
    fn test_metric_sample_clamping() {
        let sample = MetricSample {
            timestamp: Utc::now(),
            cpu_load: 1.7,
            memory_usage: -0.2,
            active_connections: 40,
            request_rate: -5.0,
            error_rate: 2.0,
            response_time_ms: -1.0,
        }
        .clamped();

        assert_eq!(sample.cpu_load, 1.0);
        assert_eq!(sample.memory_usage, 0.0);
        assert_eq!(sample.error_rate, 1.0);
        assert_eq!(sample.request_rate, 0.0);
        assert_eq!(sample.response_time_ms, 0.0);
        assert_eq!(sample.active_connections, 40);
    }

    #[test]
    fn test_gauges_clamped_on_set() {
        let server = ServerInstance::from_spec(ServerSpec::new("http://a", "us-east", 10));
        server.set_cpu(1.4);
        server.set_memory(-0.1);
        assert_eq!(server.cpu(), 1.0);
        assert_eq!(server.memory(), 0.0);
    }
}
