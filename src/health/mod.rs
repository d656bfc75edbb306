//! Background health probing for registered backend instances.

pub mod checker;

pub use checker::HealthChecker;
