//! # Redis Store
//!
//! Redis-backed [`SharedStore`] using a `ConnectionManager` (automatic
//! reconnection) with a key prefix and per-operation timeouts. Sticky
//! mappings use `SET ... EX`, so TTL enforcement is delegated to Redis.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::Duration;
use tracing::info;

use super::SharedStore;
use crate::core::config::StoreConfig;
use crate::core::error::{BalancerError, BalancerResult};

/// Redis implementation of the shared store.
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis with the configured URL.
    pub async fn connect(config: &StoreConfig) -> BalancerResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!(url = %config.url, "connected to shared store");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> BalancerResult<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(BalancerError::from),
            Err(_) => Err(BalancerError::timeout(self.operation_timeout)),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> BalancerResult<Option<String>> {
        let mut conn = self.connection.clone();
        let key = self.full_key(key);
        self.bounded(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BalancerResult<()> {
        let mut conn = self.connection.clone();
        let key = self.full_key(key);
        let value = value.to_string();
        let ttl_secs = ttl.as_secs().max(1) as u64;
        self.bounded(async move { conn.set_ex::<_, _, ()>(key, value, ttl_secs).await })
            .await
    }

    async fn delete(&self, key: &str) -> BalancerResult<()> {
        let mut conn = self.connection.clone();
        let key = self.full_key(key);
        self.bounded(async move { conn.del::<_, ()>(key).await })
            .await
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
