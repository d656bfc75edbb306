//! Selection strategies for distributing requests across healthy backend
//! instances.

pub mod strategies;

pub use strategies::{SelectionStrategy, StrategyKind};
