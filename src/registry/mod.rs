//! # Server Registry
//!
//! Holds the set of known backend instances and their live state. Each entry
//! pairs the instance with its circuit breaker so the two share a lifecycle:
//! removing a server removes its breaker in the same map operation, and no
//! orphaned breaker can outlive its instance.
//!
//! Every registry mutation (add, remove, metrics merge) mirrors the instance
//! snapshot to the shared store so multiple router processes converge on the
//! same fleet view. Health transitions are mirrored only when the status
//! actually flips, to bound write volume. Mirroring is best-effort: a store
//! failure is logged and never fails the registry operation.

use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{ServerInstance, ServerMetricsUpdate, ServerSnapshot, ServerSpec};
use crate::store::SharedStore;

/// A registry entry: instance and breaker share a lifecycle.
#[derive(Clone)]
struct ServerEntry {
    server: Arc<ServerInstance>,
    breaker: Arc<CircuitBreaker>,
}

/// Thread-safe registry of backend instances.
///
/// The hot admit/release path never takes a registry-wide lock: lookups go
/// through the concurrent map and all counter updates are per-instance
/// atomics.
pub struct ServerRegistry {
    entries: DashMap<String, ServerEntry>,
    store: Arc<dyn SharedStore>,
    breaker_config: CircuitBreakerConfig,
    mirror_ttl: Duration,
}

impl ServerRegistry {
    pub fn new(
        store: Arc<dyn SharedStore>,
        breaker_config: CircuitBreakerConfig,
        mirror_ttl: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            breaker_config,
            mirror_ttl,
        }
    }

    /// Register a backend instance: healthy, zeroed counters, paired breaker.
    /// Re-registering an existing id replaces the entry (fresh counters and a
    /// fresh breaker).
    pub async fn add_server(&self, spec: ServerSpec) -> BalancerResult<Arc<ServerInstance>> {
        let server = Arc::new(ServerInstance::from_spec(spec));
        let breaker = Arc::new(CircuitBreaker::new(
            server.id.clone(),
            self.breaker_config.clone(),
        ));

        let replaced = self
            .entries
            .insert(
                server.id.clone(),
                ServerEntry {
                    server: server.clone(),
                    breaker,
                },
            )
            .is_some();

        gauge!("fleet_registered_servers").set(self.entries.len() as f64);
        info!(
            server_id = %server.id,
            url = %server.url,
            region = %server.region,
            replaced,
            "registered backend instance"
        );

        self.mirror(&server).await;
        Ok(server)
    }

    /// Remove an instance and its breaker atomically.
    pub async fn remove_server(&self, id: &str) -> BalancerResult<()> {
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| BalancerError::unknown_server(id))?;

        gauge!("fleet_registered_servers").set(self.entries.len() as f64);
        info!(server_id = %entry.server.id, "removed backend instance");

        if let Err(e) = self.store.delete(&mirror_key(id)).await {
            warn!(server_id = %id, error = %e, "failed to delete mirrored registry entry");
        }
        Ok(())
    }

    /// Merge a partial metrics update into an instance. A no-op when the id is
    /// unknown (the instance may have been drained between push and delivery).
    pub async fn update_server_metrics(&self, id: &str, update: ServerMetricsUpdate) {
        let server = match self.get(id) {
            Some(server) => server,
            None => {
                debug!(server_id = %id, "metrics update for unknown server ignored");
                return;
            }
        };

        if let Some(cpu) = update.cpu {
            server.set_cpu(cpu);
        }
        if let Some(memory) = update.memory {
            server.set_memory(memory);
        }
        if let Some(connections) = update.connections {
            server.set_connections(connections);
        }
        if let Some(response_time_ms) = update.response_time_ms {
            server.observe_response_time(response_time_ms);
        }

        self.mirror(&server).await;
    }

    /// Connection-close callback: release one unit of load from an instance.
    /// Unknown ids are ignored.
    pub fn release(&self, id: &str) {
        if let Some(server) = self.get(id) {
            server.release();
        }
    }

    /// Fetch an instance by id.
    pub fn get(&self, id: &str) -> Option<Arc<ServerInstance>> {
        self.entries.get(id).map(|entry| entry.server.clone())
    }

    /// Fetch the breaker paired with an instance.
    pub fn breaker(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries.get(id).map(|entry| entry.breaker.clone())
    }

    /// All instances currently marked healthy, ordered by id. The stable
    /// ordering is what makes round-robin and IP-hash selection well defined
    /// across calls while membership is unchanged.
    pub fn healthy_servers(&self) -> Vec<Arc<ServerInstance>> {
        let mut servers: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.server.is_healthy())
            .map(|entry| entry.server.clone())
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// All registered instances, ordered by id.
    pub fn all_servers(&self) -> Vec<Arc<ServerInstance>> {
        let mut servers: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.server.clone())
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// Immutable copy of all instances for reporting.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.all_servers()
            .iter()
            .map(|server| server.snapshot())
            .collect()
    }

    /// Breaker state labels keyed by server id.
    pub fn breaker_states(&self) -> std::collections::HashMap<String, CircuitState> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.breaker.state()))
            .collect()
    }

    /// Flip an instance's health flag. Returns whether the status actually
    /// changed; the mirror write happens only on a flip. Reserved for the
    /// health checker and drain start.
    pub async fn set_health(&self, id: &str, healthy: bool) -> BalancerResult<bool> {
        let server = self
            .get(id)
            .ok_or_else(|| BalancerError::unknown_server(id))?;

        server.touch_health_check();
        let was_healthy = server.set_healthy(healthy);
        let flipped = was_healthy != healthy;

        if flipped {
            info!(server_id = %id, healthy, "health status changed");
            self.mirror(&server).await;
        }
        Ok(flipped)
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn mirror(&self, server: &ServerInstance) {
        let snapshot = server.snapshot();
        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(server_id = %server.id, error = %e, "failed to serialize registry mirror");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_with_ttl(&mirror_key(&server.id), &payload, self.mirror_ttl)
            .await
        {
            warn!(server_id = %server.id, error = %e, "failed to mirror registry entry");
        }
    }
}

fn mirror_key(id: &str) -> String {
    format!("server:{}", id)
}
