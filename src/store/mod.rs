//! # Shared Key-Value Store
//!
//! Abstraction over the external store used for sticky sessions and
//! cross-process registry mirroring. Two implementations are provided: a
//! Redis-backed store for production and an in-process store for tests and
//! single-node deployments.
//!
//! Store access is always best-effort from the router's point of view:
//! mirroring and sticky bookkeeping log failures and move on, they never fail
//! a routing call.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::error::BalancerResult;

/// Minimal key-value contract consumed by the registry and the sticky-session
/// bookkeeping: `get`, `set` with TTL, `delete`.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Fetch a value by key; `None` when absent or expired.
    async fn get(&self, key: &str) -> BalancerResult<Option<String>>;

    /// Store a value with a time-to-live.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BalancerResult<()>;

    /// Remove a key; removing an absent key is not an error.
    async fn delete(&self, key: &str) -> BalancerResult<()>;
}
