//! # Health Checker
//!
//! Probes every registered instance on a fixed interval, independent of
//! request traffic, and writes the outcome into the registry. A probe is one
//! bounded-timeout GET against the instance's health endpoint; 2xx within the
//! deadline means healthy, anything else (non-2xx, connect error, timeout)
//! means unhealthy.
//!
//! Failures here are recovered locally: the instance is marked unhealthy,
//! the error is logged, and the sweep continues. Nothing from this loop is
//! ever surfaced to routing callers, and the registry mirrors a health write
//! to the shared store only when the status actually flips.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::HealthCheckConfig;
use crate::core::types::ServerInstance;
use crate::registry::ServerRegistry;

/// Periodic prober for the whole fleet.
pub struct HealthChecker {
    registry: Arc<ServerRegistry>,
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServerRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Start the probe loop. The task runs until `shutdown` is cancelled and
    /// never outlives its owner.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval = ?self.config.interval,
                probe_timeout = ?self.config.probe_timeout,
                "health checker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("health checker stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                }
            }
        })
    }

    /// Probe every registered instance concurrently. One sweep; each probe is
    /// individually bounded so a hung backend cannot stall the loop.
    pub async fn check_all(&self) {
        let servers = self.registry.all_servers();
        if servers.is_empty() {
            return;
        }

        join_all(servers.iter().map(|server| self.probe(server))).await;
    }

    async fn probe(&self, server: &Arc<ServerInstance>) {
        let url = probe_url(&server.url, &self.config.path);
        let started = Instant::now();

        let healthy = match timeout(self.config.probe_timeout, self.client.get(&url).send()).await
        {
            Ok(Ok(response)) if response.status().is_success() => {
                server.observe_response_time(started.elapsed().as_secs_f64() * 1000.0);
                true
            }
            Ok(Ok(response)) => {
                debug!(
                    server_id = %server.id,
                    status = %response.status(),
                    "health probe returned non-success status"
                );
                false
            }
            Ok(Err(e)) => {
                debug!(server_id = %server.id, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(
                    server_id = %server.id,
                    timeout = ?self.config.probe_timeout,
                    "health probe timed out"
                );
                false
            }
        };

        match self.registry.set_health(&server.id, healthy).await {
            Ok(true) => {
                if healthy {
                    info!(server_id = %server.id, "instance recovered");
                } else {
                    warn!(server_id = %server.id, "instance marked unhealthy");
                }
            }
            Ok(false) => {}
            // Instance removed while the probe was in flight.
            Err(e) => debug!(server_id = %server.id, error = %e, "health update skipped"),
        }
    }
}

fn probe_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
