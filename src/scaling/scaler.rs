//! # Fleet Scaler
//!
//! Closed-loop control of fleet size. Each evaluation combines the latest
//! observed load with the predictor's forecast, computes the instance count
//! needed to keep CPU and memory under their utilization targets, amplifies
//! for connection and request pressure, and clamps the result to the
//! configured bounds.
//!
//! Two pieces of hysteresis keep the loop from oscillating: separate
//! cooldowns for scale-up and scale-down, and a single-flight guard that
//! turns an evaluation arriving while another scaling operation is running
//! into a no-op rather than queueing it. Manual overrides bypass the
//! cooldowns but never the bounds, and always log the trigger source.

use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::config::ScalerConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{ScalingAction, ScalingDecision};
use crate::provision::ProvisioningProvider;
use crate::registry::ServerRegistry;
use crate::scaling::drain::drain_server;
use crate::telemetry::{MetricsCollector, TrafficPredictor};

/// Predictive autoscaler driving the provisioning provider.
pub struct FleetScaler {
    registry: Arc<ServerRegistry>,
    collector: Arc<MetricsCollector>,
    predictor: Arc<TrafficPredictor>,
    provisioner: Arc<dyn ProvisioningProvider>,
    config: ScalerConfig,

    last_scale_up: Mutex<Option<Instant>>,
    last_scale_down: Mutex<Option<Instant>>,

    /// Single-flight flag: set while an evaluate/execute sequence runs.
    in_flight: AtomicBool,
}

/// Resets the single-flight flag when an evaluate/execute sequence ends,
/// including on early return.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FleetScaler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        collector: Arc<MetricsCollector>,
        predictor: Arc<TrafficPredictor>,
        provisioner: Arc<dyn ProvisioningProvider>,
        config: ScalerConfig,
    ) -> Self {
        Self {
            registry,
            collector,
            predictor,
            provisioner,
            config,
            last_scale_up: Mutex::new(None),
            last_scale_down: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Start the background evaluation loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.evaluation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval = ?self.config.evaluation_interval,
                min = self.config.min_instances,
                max = self.config.max_instances,
                "fleet scaler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("fleet scaler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(decision) => debug!(
                                action = ?decision.action,
                                current = decision.current_instances,
                                optimal = decision.optimal_instances,
                                reason = %decision.reason,
                                "scaling evaluation complete"
                            ),
                            // Another operation (e.g. a manual scale) holds
                            // the flag; skip this cycle.
                            Err(BalancerError::ScalingInProgress) => {
                                debug!("scaling already in progress, skipping cycle");
                            }
                            Err(e) => error!(error = %e, "scaling cycle failed"),
                        }
                    }
                }
            }
        })
    }

    /// Compute a scaling recommendation without executing it.
    pub fn evaluate(&self) -> ScalingDecision {
        let current = self.registry.len() as u32;

        let latest = match self.collector.latest() {
            Some(latest) => latest,
            None => return ScalingDecision::no_change(current, "no load samples collected yet"),
        };
        let forecast = self.predictor.forecast();

        let cpu = latest.cpu_load.max(forecast.cpu_load);
        let memory = latest.memory_usage.max(forecast.memory_usage);

        let cpu_instances = (cpu / self.config.target_cpu_utilization).ceil() as u32;
        let memory_instances = (memory / self.config.target_memory_utilization).ceil() as u32;
        let base = cpu_instances.max(memory_instances);

        // Connection and request pressure can demand more instances than
        // resource utilization alone suggests.
        let amplification = 1.0_f64
            .max(forecast.active_connections / 100.0)
            .max(latest.request_rate / 50.0);

        let optimal = ((f64::from(base) * amplification).ceil() as u32)
            .clamp(self.config.min_instances, self.config.max_instances);

        gauge!("fleet_optimal_instances").set(f64::from(optimal));

        let detail = format!(
            "cpu {:.2} (predicted {:.2}), memory {:.2} (predicted {:.2}), \
             predicted connections {:.0}, confidence {:.2}",
            latest.cpu_load,
            forecast.cpu_load,
            latest.memory_usage,
            forecast.memory_usage,
            forecast.active_connections,
            forecast.confidence,
        );

        if optimal == current {
            return ScalingDecision::no_change(current, format!("fleet size matches demand: {}", detail));
        }

        if optimal > current {
            if let Some(remaining) = self.cooldown_remaining(&self.last_scale_up, self.config.scale_up_cooldown) {
                return ScalingDecision {
                    current_instances: current,
                    optimal_instances: optimal,
                    action: ScalingAction::NoChange,
                    cooldown_remaining: Some(remaining),
                    reason: format!(
                        "scale-up to {} suppressed: cooldown active for {}s",
                        optimal,
                        remaining.as_secs()
                    ),
                };
            }
            return ScalingDecision {
                current_instances: current,
                optimal_instances: optimal,
                action: ScalingAction::ScaleUp,
                cooldown_remaining: None,
                reason: format!("demand requires {} instances: {}", optimal, detail),
            };
        }

        if let Some(remaining) = self.cooldown_remaining(&self.last_scale_down, self.config.scale_down_cooldown) {
            return ScalingDecision {
                current_instances: current,
                optimal_instances: optimal,
                action: ScalingAction::NoChange,
                cooldown_remaining: Some(remaining),
                reason: format!(
                    "scale-down to {} suppressed: cooldown active for {}s",
                    optimal,
                    remaining.as_secs()
                ),
            };
        }
        ScalingDecision {
            current_instances: current,
            optimal_instances: optimal,
            action: ScalingAction::ScaleDown,
            cooldown_remaining: None,
            reason: format!("demand satisfied by {} instances: {}", optimal, detail),
        }
    }

    /// One evaluate/execute cycle under the single-flight guard.
    pub async fn run_once(&self) -> BalancerResult<ScalingDecision> {
        let _guard = self.begin()?;
        let decision = self.evaluate();
        self.execute(&decision).await;
        Ok(decision)
    }

    /// Operator override: scale to `target` regardless of cooldowns. Bounds
    /// still apply, and the action is always logged with its trigger source.
    pub async fn manual_scale(
        &self,
        target: u32,
        reason: &str,
    ) -> BalancerResult<ScalingDecision> {
        let _guard = self.begin()?;

        let clamped = target.clamp(self.config.min_instances, self.config.max_instances);
        let current = self.registry.len() as u32;

        let action = match clamped.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingAction::ScaleUp,
            std::cmp::Ordering::Less => ScalingAction::ScaleDown,
            std::cmp::Ordering::Equal => ScalingAction::NoChange,
        };

        let decision = ScalingDecision {
            current_instances: current,
            optimal_instances: clamped,
            action,
            cooldown_remaining: None,
            reason: format!("manual scale to {} ({})", clamped, reason),
        };

        info!(
            requested = target,
            target = clamped,
            current,
            reason = %reason,
            trigger = "manual",
            "manual scaling requested"
        );

        self.execute(&decision).await;
        Ok(decision)
    }

    fn begin(&self) -> BalancerResult<InFlightGuard<'_>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(BalancerError::ScalingInProgress);
        }
        Ok(InFlightGuard(&self.in_flight))
    }

    fn cooldown_remaining(
        &self,
        last: &Mutex<Option<Instant>>,
        cooldown: Duration,
    ) -> Option<Duration> {
        last.lock()
            .and_then(|at| cooldown.checked_sub(at.elapsed()))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Apply an approved decision. Provisioning failures are logged and leave
    /// fleet state unchanged; the next cycle retries naturally.
    async fn execute(&self, decision: &ScalingDecision) {
        match decision.action {
            ScalingAction::NoChange => {}
            ScalingAction::ScaleUp => {
                let added = self
                    .scale_up(decision.optimal_instances - decision.current_instances)
                    .await;
                if added > 0 {
                    *self.last_scale_up.lock() = Some(Instant::now());
                    counter!("fleet_scale_ups").increment(1);
                    info!(added, reason = %decision.reason, "fleet scaled up");
                }
            }
            ScalingAction::ScaleDown => {
                let removed = self
                    .scale_down(decision.current_instances - decision.optimal_instances)
                    .await;
                if removed > 0 {
                    *self.last_scale_down.lock() = Some(Instant::now());
                    counter!("fleet_scale_downs").increment(1);
                    info!(removed, reason = %decision.reason, "fleet scaled down");
                }
            }
        }
    }

    async fn scale_up(&self, count: u32) -> u32 {
        let mut added = 0;
        for _ in 0..count {
            match self
                .provisioner
                .add_instance(&self.config.instance_template)
                .await
            {
                Ok(spec) => match self.registry.add_server(spec).await {
                    Ok(server) => {
                        debug!(server_id = %server.id, "provisioned instance joined fleet");
                        added += 1;
                    }
                    Err(e) => error!(error = %e, "failed to register provisioned instance"),
                },
                Err(e) => {
                    error!(error = %e, "provisioning failed, retrying next cycle");
                    break;
                }
            }
        }
        added
    }

    /// Drain the least-loaded instances first. Drains run concurrently and
    /// each blocks only its own removal.
    async fn scale_down(&self, count: u32) -> u32 {
        let mut servers = self.registry.all_servers();
        servers.sort_by_key(|server| server.connections());

        let victims: Vec<String> = servers
            .iter()
            .take(count as usize)
            .map(|server| server.id.clone())
            .collect();

        let outcomes = join_all(victims.iter().map(|id| async move {
            let outcome = drain_server(&self.registry, id, self.config.drain_timeout).await?;
            self.provisioner.remove_instance(id).await?;
            Ok::<_, BalancerError>(outcome)
        }))
        .await;

        let mut removed = 0;
        for (id, outcome) in victims.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    debug!(server_id = %id, forced = outcome.forced, "instance drained");
                    removed += 1;
                }
                Err(e) => error!(server_id = %id, error = %e, "drain-removal failed"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::core::config::{CollectorConfig, PredictorConfig};
    use crate::core::types::{MetricSample, ServerSpec};
    use crate::provision::StaticPoolProvisioner;
    use crate::store::MemoryStore;
    use crate::telemetry::source::MetricsSource;
    use async_trait::async_trait;
    use chrono::Utc;

    struct NullSource;

    #[async_trait]
    impl MetricsSource for NullSource {
        async fn sample(&self) -> BalancerResult<MetricSample> {
            Ok(MetricSample::fallback(Utc::now()))
        }
    }

    struct Fixture {
        registry: Arc<ServerRegistry>,
        collector: Arc<MetricsCollector>,
        scaler: FleetScaler,
    }

    fn fixture(config: ScalerConfig, standby: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ServerRegistry::new(
            store,
            CircuitBreakerConfig::default(),
            Duration::from_secs(60),
        ));
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(NullSource),
            CollectorConfig::default(),
        ));
        let predictor = Arc::new(TrafficPredictor::new(
            collector.clone(),
            PredictorConfig::default(),
        ));
        let pool: Vec<ServerSpec> = (0..standby)
            .map(|i| {
                ServerSpec::with_id(
                    format!("standby-{}", i),
                    format!("http://standby-{}", i),
                    "default",
                    100,
                )
            })
            .collect();
        let scaler = FleetScaler::new(
            registry.clone(),
            collector.clone(),
            predictor,
            Arc::new(StaticPoolProvisioner::new(pool)),
            config,
        );
        Fixture {
            registry,
            collector,
            scaler,
        }
    }

    fn load_sample(cpu: f64, memory: f64, connections: u32, rate: f64) -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            cpu_load: cpu,
            memory_usage: memory,
            active_connections: connections,
            request_rate: rate,
            error_rate: 0.0,
            response_time_ms: 20.0,
        }
    }

    async fn seed_servers(registry: &ServerRegistry, n: usize) {
        for i in 0..n {
            registry
                .add_server(ServerSpec::with_id(
                    format!("srv-{}", i),
                    format!("http://10.0.0.{}", i),
                    "default",
                    100,
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_utilization_math_matches_targets() {
        // cpu 0.85 / target 0.7 -> 2 instances; memory 0.60 / target 0.8 -> 1;
        // optimal = max(2, 1) = 2.
        let fx = fixture(ScalerConfig::default(), 4);
        seed_servers(&fx.registry, 1).await;
        fx.collector.record(load_sample(0.85, 0.60, 50, 10.0));

        let decision = fx.scaler.evaluate();
        assert_eq!(decision.optimal_instances, 2);
        assert_eq!(decision.action, ScalingAction::ScaleUp);
    }

    #[tokio::test]
    async fn test_no_metrics_yields_no_change() {
        let fx = fixture(ScalerConfig::default(), 4);
        seed_servers(&fx.registry, 2).await;

        let decision = fx.scaler.evaluate();
        assert_eq!(decision.action, ScalingAction::NoChange);
        assert!(decision.reason.contains("no load samples"));
    }

    #[tokio::test]
    async fn test_optimal_always_within_bounds() {
        let config = ScalerConfig {
            min_instances: 2,
            max_instances: 5,
            ..ScalerConfig::default()
        };
        let fx = fixture(config, 10);
        seed_servers(&fx.registry, 3).await;

        // Extreme demand clamps to max.
        fx.collector.record(load_sample(1.0, 1.0, 5000, 500.0));
        assert_eq!(fx.scaler.evaluate().optimal_instances, 5);

        // Zero demand clamps to min.
        fx.collector.record(load_sample(0.0, 0.0, 0, 0.0));
        assert_eq!(fx.scaler.evaluate().optimal_instances, 2);
    }

    #[tokio::test]
    async fn test_connection_pressure_amplifies_base() {
        let fx = fixture(ScalerConfig::default(), 10);
        seed_servers(&fx.registry, 1).await;

        // base = ceil(0.35/0.7) = 1; amplification = 300/100 = 3.
        fx.collector.record(load_sample(0.35, 0.2, 300, 0.0));
        assert_eq!(fx.scaler.evaluate().optimal_instances, 3);
    }

    #[tokio::test]
    async fn test_scale_up_executes_and_cooldown_suppresses_second_attempt() {
        let fx = fixture(ScalerConfig::default(), 8);
        seed_servers(&fx.registry, 1).await;
        fx.collector.record(load_sample(0.85, 0.60, 50, 10.0));

        let decision = fx.scaler.run_once().await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(fx.registry.len(), 2);

        // More demand immediately after: suppressed by the scale-up cooldown.
        fx.collector.record(load_sample(0.85, 0.60, 300, 10.0));
        let second = fx.scaler.evaluate();
        assert_eq!(second.action, ScalingAction::NoChange);
        assert!(second.cooldown_remaining.is_some());
        assert!(second.reason.contains("cooldown"));
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_drains_least_loaded() {
        let config = ScalerConfig {
            drain_timeout: Duration::from_millis(200),
            ..ScalerConfig::default()
        };
        let fx = fixture(config, 0);
        seed_servers(&fx.registry, 3).await;
        // srv-2 carries traffic; the idle instances drain first.
        fx.registry.get("srv-2").unwrap().admit();

        fx.collector.record(load_sample(0.05, 0.05, 0, 0.0));
        let decision = fx.scaler.run_once().await.unwrap();

        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(fx.registry.len(), 1);
        assert!(fx.registry.get("srv-2").is_some());
    }

    #[tokio::test]
    async fn test_single_flight_rejects_concurrent_evaluation() {
        let fx = fixture(ScalerConfig::default(), 0);
        seed_servers(&fx.registry, 1).await;

        fx.scaler.in_flight.store(true, Ordering::SeqCst);
        assert!(matches!(
            fx.scaler.run_once().await,
            Err(BalancerError::ScalingInProgress)
        ));

        fx.scaler.in_flight.store(false, Ordering::SeqCst);
        assert!(fx.scaler.run_once().await.is_ok());
    }

    #[tokio::test]
    async fn test_manual_scale_bypasses_cooldown_but_not_bounds() {
        let config = ScalerConfig {
            max_instances: 4,
            ..ScalerConfig::default()
        };
        let fx = fixture(config, 10);
        seed_servers(&fx.registry, 1).await;

        // A cooldown stamped moments ago would block an automatic scale-up.
        *fx.scaler.last_scale_up.lock() = Some(Instant::now());

        let decision = fx.scaler.manual_scale(20, "load test").await.unwrap();
        assert_eq!(decision.optimal_instances, 4);
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(fx.registry.len(), 4);
    }

    #[tokio::test]
    async fn test_provisioning_failure_leaves_fleet_unchanged() {
        // Empty standby pool: every add fails.
        let fx = fixture(ScalerConfig::default(), 0);
        seed_servers(&fx.registry, 1).await;
        fx.collector.record(load_sample(0.95, 0.60, 50, 10.0));

        let decision = fx.scaler.run_once().await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(fx.registry.len(), 1);

        // No cooldown stamped: the next cycle retries immediately.
        assert!(fx.scaler.cooldown_remaining(
            &fx.scaler.last_scale_up,
            fx.scaler.config.scale_up_cooldown
        ).is_none());
    }
}
