//! # Fleet Manager
//!
//! Top-level facade wiring the registry, router, health checker, metrics
//! collector, and fleet scaler together, and owning their background tasks.
//!
//! The three loops (health probing, metrics polling, scaling evaluation) are
//! spawned by [`FleetManager::start`] under a single [`CancellationToken`]
//! and awaited by [`FleetManager::shutdown`], so no loop outlives the
//! manager. All operator-facing operations are exposed here as plain async
//! methods.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::BalancerConfig;
use crate::core::error::BalancerResult;
use crate::core::types::{
    RequestContext, ScalingDecision, ServerInstance, ServerMetricsUpdate, ServerSpec,
};
use crate::health::HealthChecker;
use crate::provision::ProvisioningProvider;
use crate::registry::ServerRegistry;
use crate::routing::{FleetStats, RouteDecision, Router};
use crate::scaling::{drain_server, DrainOutcome, FleetScaler};
use crate::store::SharedStore;
use crate::telemetry::{MetricsCollector, MetricsSource, TrafficPredictor};

/// Owns every balancer component and their background loops.
pub struct FleetManager {
    config: BalancerConfig,
    registry: Arc<ServerRegistry>,
    router: Router,
    health: Arc<HealthChecker>,
    collector: Arc<MetricsCollector>,
    scaler: Arc<FleetScaler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetManager {
    /// Wire the components from configuration and the three external
    /// collaborators. Validates the configuration; does not start any
    /// background work yet.
    pub fn new(
        config: BalancerConfig,
        store: Arc<dyn SharedStore>,
        source: Arc<dyn MetricsSource>,
        provisioner: Arc<dyn ProvisioningProvider>,
    ) -> BalancerResult<Self> {
        config.validate()?;

        let registry = Arc::new(ServerRegistry::new(
            store.clone(),
            config.circuit_breaker.clone(),
            config.store.mirror_ttl,
        ));
        let router = Router::new(
            registry.clone(),
            config.strategy.build(),
            store,
            &config.router,
        );
        let collector = Arc::new(MetricsCollector::new(source, config.collector.clone()));
        let predictor = Arc::new(TrafficPredictor::new(
            collector.clone(),
            config.predictor.clone(),
        ));
        let scaler = Arc::new(FleetScaler::new(
            registry.clone(),
            collector.clone(),
            predictor,
            provisioner,
            config.scaler.clone(),
        ));
        let health = Arc::new(HealthChecker::new(registry.clone(), config.health.clone()));

        Ok(Self {
            config,
            registry,
            router,
            health,
            collector,
            scaler,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the health, metrics, and scaling loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.health.clone().spawn(self.shutdown.clone()));
        tasks.push(self.collector.clone().spawn(self.shutdown.clone()));
        tasks.push(self.scaler.clone().spawn(self.shutdown.clone()));
        info!(strategy = self.router.strategy_name(), "fleet manager started");
    }

    /// Stop all background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("fleet manager stopped");
    }

    /// Register a backend instance.
    pub async fn add_server(&self, spec: ServerSpec) -> BalancerResult<Arc<ServerInstance>> {
        self.registry.add_server(spec).await
    }

    /// Remove a backend instance without draining it first.
    pub async fn remove_server(&self, id: &str) -> BalancerResult<()> {
        self.registry.remove_server(id).await
    }

    /// Route one request to a backend instance.
    pub async fn route_request(&self, ctx: &RequestContext) -> BalancerResult<RouteDecision> {
        self.router.route_request(ctx).await
    }

    /// Completion callback for a routed request.
    pub fn record_outcome(&self, server_id: &str, success: bool, response_time_ms: Option<f64>) {
        self.router.record_outcome(server_id, success, response_time_ms)
    }

    /// Merge externally pushed metrics into an instance.
    pub async fn update_server_metrics(&self, id: &str, update: ServerMetricsUpdate) {
        self.registry.update_server_metrics(id, update).await
    }

    /// Fleet snapshot: per-instance state, breaker states, aggregates, and
    /// region distribution.
    pub fn stats(&self) -> FleetStats {
        self.router.stats()
    }

    /// Current scaling recommendation, without executing it.
    pub fn evaluate(&self) -> ScalingDecision {
        self.scaler.evaluate()
    }

    /// Operator override scaling; bypasses cooldowns, respects bounds.
    pub async fn manual_scale(&self, target: u32, reason: &str) -> BalancerResult<ScalingDecision> {
        self.scaler.manual_scale(target, reason).await
    }

    /// Gracefully drain and remove one instance.
    pub async fn drain_server(&self, id: &str) -> BalancerResult<DrainOutcome> {
        drain_server(&self.registry, id, self.config.scaler.drain_timeout).await
    }

    /// Shared registry handle, for callers embedding the balancer.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BalancerError;
    use crate::core::types::MetricSample;
    use crate::provision::StaticPoolProvisioner;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    struct NullSource;

    #[async_trait]
    impl MetricsSource for NullSource {
        async fn sample(&self) -> BalancerResult<MetricSample> {
            Ok(MetricSample::fallback(Utc::now()))
        }
    }

    fn manager() -> FleetManager {
        FleetManager::new(
            BalancerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullSource),
            Arc::new(StaticPoolProvisioner::new(Vec::new())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_start_and_shutdown() {
        let manager = manager();
        manager.start();
        // Loops are running; shutdown must cancel and join all of them.
        manager.shutdown().await;
        assert!(manager.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_operator_surface_round_trip() {
        let manager = manager();
        manager
            .add_server(ServerSpec::with_id("srv-1", "http://a", "us-east", 10))
            .await
            .unwrap();

        let ctx = RequestContext::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        let decision = manager.route_request(&ctx).await.unwrap();
        assert_eq!(decision.server.id, "srv-1");

        manager.record_outcome("srv-1", true, Some(12.0));

        let stats = manager.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);

        manager.drain_server("srv-1").await.unwrap();
        assert!(matches!(
            manager.route_request(&ctx).await,
            Err(BalancerError::NoHealthyServers)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let mut config = BalancerConfig::default();
        config.scaler.max_instances = 0;
        let result = FleetManager::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NullSource),
            Arc::new(StaticPoolProvisioner::new(Vec::new())),
        );
        assert!(matches!(result, Err(BalancerError::Configuration { .. })));
    }
}
