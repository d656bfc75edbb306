//! Load telemetry: the external metrics source, the bounded sample window,
//! and the traffic predictor that feeds the fleet scaler.

pub mod collector;
pub mod predictor;
pub mod source;

pub use collector::MetricsCollector;
pub use predictor::{LoadForecast, TrafficPredictor};
pub use source::{HttpMetricsSource, MetricsSource};
