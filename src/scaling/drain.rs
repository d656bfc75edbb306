//! # Graceful Drain
//!
//! Removal sequence that stops admitting new work to an instance and waits
//! for in-flight work to finish before deleting it. The instance is marked
//! unhealthy immediately on drain start (which also mirrors the flip to the
//! shared store), so the router stops selecting it while existing connections
//! wind down.
//!
//! A drain blocks only its own removal: it is an ordinary awaited future
//! bounded by the drain timeout, and concurrent drains of other instances
//! proceed independently.

use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::error::{BalancerError, BalancerResult};
use crate::registry::ServerRegistry;

/// How often the drain re-checks the connection counter.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a completed drain.
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub server_id: String,

    /// True when the timeout elapsed with connections still in flight and
    /// removal was forced.
    pub forced: bool,

    /// How long the drain waited before removal.
    pub waited: Duration,
}

/// Drain and remove one instance.
///
/// Completes removal when active connections reach zero or `drain_timeout`
/// elapses, whichever comes first.
pub async fn drain_server(
    registry: &ServerRegistry,
    id: &str,
    drain_timeout: Duration,
) -> BalancerResult<DrainOutcome> {
    let server = registry
        .get(id)
        .ok_or_else(|| BalancerError::unknown_server(id))?;

    // Stop new admissions before waiting out in-flight work.
    registry.set_health(id, false).await?;
    info!(server_id = %id, connections = server.connections(), "drain started");

    let started = Instant::now();
    let forced = loop {
        if server.connections() == 0 {
            break false;
        }
        if started.elapsed() >= drain_timeout {
            break true;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    };

    let waited = started.elapsed();
    if forced {
        warn!(
            server_id = %id,
            remaining_connections = server.connections(),
            waited_ms = waited.as_millis() as u64,
            "drain timeout elapsed, forcing removal"
        );
    } else {
        info!(
            server_id = %id,
            waited_ms = waited.as_millis() as u64,
            "drain completed cleanly"
        );
    }

    registry.remove_server(id).await?;

    Ok(DrainOutcome {
        server_id: id.to_string(),
        forced,
        waited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::core::error::BalancerError;
    use crate::core::types::ServerSpec;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn test_registry() -> Arc<ServerRegistry> {
        Arc::new(ServerRegistry::new(
            Arc::new(MemoryStore::new()),
            CircuitBreakerConfig::default(),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_drain_removes_idle_instance_immediately() {
        let registry = test_registry();
        registry
            .add_server(ServerSpec::with_id("srv-1", "http://a", "us-east", 10))
            .await
            .unwrap();

        let outcome = drain_server(&registry, "srv-1", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!outcome.forced);
        assert!(registry.get("srv-1").is_none());
        assert!(registry.breaker("srv-1").is_none());
    }

    #[tokio::test]
    async fn test_drain_marks_unhealthy_immediately_then_waits_for_release() {
        let registry = test_registry();
        let server = registry
            .add_server(ServerSpec::with_id("srv-1", "http://a", "us-east", 10))
            .await
            .unwrap();
        server.admit();

        let drain_registry = registry.clone();
        let drain = tokio::spawn(async move {
            drain_server(&drain_registry, "srv-1", Duration::from_secs(5)).await
        });

        // Unhealthy as soon as the drain starts, but not yet removed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let draining = registry.get("srv-1").expect("still registered");
        assert!(!draining.is_healthy());

        // Completion callback releases the last connection; drain finishes.
        server.release();
        let outcome = drain.await.unwrap().unwrap();
        assert!(!outcome.forced);
        assert!(registry.get("srv-1").is_none());
    }

    #[tokio::test]
    async fn test_drain_forces_removal_at_timeout() {
        let registry = test_registry();
        let server = registry
            .add_server(ServerSpec::with_id("srv-1", "http://a", "us-east", 10))
            .await
            .unwrap();
        server.admit();

        let outcome = drain_server(&registry, "srv-1", Duration::from_millis(250))
            .await
            .unwrap();

        assert!(outcome.forced);
        assert!(outcome.waited >= Duration::from_millis(250));
        assert!(registry.get("srv-1").is_none());
    }

    #[tokio::test]
    async fn test_drain_unknown_server_errors() {
        let registry = test_registry();
        assert!(matches!(
            drain_server(&registry, "ghost", Duration::from_secs(1)).await,
            Err(BalancerError::UnknownServer { .. })
        ));
    }
}
