//! # Fleet Balancer
//!
//! Routes inbound work to one of several backend instances, continuously
//! tracks instance health and load, isolates failing instances behind
//! per-instance circuit breakers, and adjusts fleet size in response to
//! observed and predicted demand.
//!
//! ## Architecture
//!
//! - [`registry::ServerRegistry`] holds the fleet: each entry pairs a backend
//!   instance with its circuit breaker, and mutations are mirrored to the
//!   shared store so multiple router processes converge on one view.
//! - [`balancing`] provides the selection strategies (round-robin,
//!   least-connections, weighted, IP-hash, geographic, fastest-response) as a
//!   closed set chosen at construction time.
//! - [`routing::Router`] answers "which instance handles this request now":
//!   sticky-session lookup, strategy selection, breaker guard, and
//!   retry-with-exclusion.
//! - [`health::HealthChecker`] probes every instance on a fixed interval and
//!   writes flips back into the registry.
//! - [`telemetry`] maintains the bounded load-sample window and forecasts
//!   near-term demand from time-of-day cohorts.
//! - [`scaling::FleetScaler`] turns current plus predicted load into scaling
//!   actions, with cooldown hysteresis and graceful drain-removal.
//! - [`manager::FleetManager`] wires it all together and owns the background
//!   loops.

pub mod balancing;
pub mod core;
pub mod health;
pub mod manager;
pub mod provision;
pub mod registry;
pub mod routing;
pub mod scaling;
pub mod store;
pub mod telemetry;

pub use crate::core::config::BalancerConfig;
pub use crate::core::error::{BalancerError, BalancerResult};
pub use crate::core::types::{
    MetricSample, RequestContext, ScalingAction, ScalingDecision, ServerInstance,
    ServerMetricsUpdate, ServerSnapshot, ServerSpec,
};

pub use crate::balancing::StrategyKind;
pub use crate::manager::FleetManager;
pub use crate::routing::{FleetStats, RouteDecision, Router};
