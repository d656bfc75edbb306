//! Core building blocks: error taxonomy, configuration, shared data types,
//! and the per-instance circuit breaker.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod types;
