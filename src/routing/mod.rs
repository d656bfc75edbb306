//! # Request Router
//!
//! Orchestrates a single routing decision: sticky-session lookup, strategy
//! selection over the healthy set, the per-instance circuit-breaker guard,
//! and retry-with-exclusion when a candidate is rejected.
//!
//! Admission increments the chosen instance's load and connection counters.
//! Releasing that load is an explicit external contract: the caller reports
//! completion through [`Router::record_outcome`], which also feeds the
//! instance's circuit breaker and response-time EWMA. The router never infers
//! completion on its own.

use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use serde::{Deserialize, Serialize};

use crate::balancing::SelectionStrategy;
use crate::core::config::RouterConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{RequestContext, ServerInstance, ServerSnapshot};
use crate::registry::ServerRegistry;
use crate::store::SharedStore;

/// Result of a successful routing call.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// The admitted instance; its load/connection counters have already been
    /// incremented.
    pub server: Arc<ServerInstance>,

    /// Selection attempts that failed before this one succeeded.
    pub retries: u32,

    /// Whether the decision came from the sticky-session fast path.
    pub sticky_hit: bool,
}

/// Sticky-session bookkeeping against the shared store.
///
/// Advisory only: lookups that fail or reference a missing/unhealthy server
/// fall back to normal strategy selection, and a fresh mapping is recorded.
/// Store failures are logged and never fail a routing call.
struct StickySessions {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl StickySessions {
    fn key(session_id: &str) -> String {
        format!("sticky:{}", session_id)
    }

    async fn lookup(&self, session_id: &str) -> Option<String> {
        match self.store.get(&Self::key(session_id)).await {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "sticky lookup failed");
                None
            }
        }
    }

    async fn record(&self, session_id: &str, server_id: &str) {
        if let Err(e) = self
            .store
            .set_with_ttl(&Self::key(session_id), server_id, self.ttl)
            .await
        {
            warn!(
                session_id = %session_id,
                server_id = %server_id,
                error = %e,
                "failed to record sticky mapping"
            );
        }
    }
}

/// Aggregate fleet view returned by [`Router::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStats {
    /// Per-instance snapshots, ordered by id.
    pub servers: Vec<ServerSnapshot>,

    /// Circuit-breaker state labels keyed by server id.
    pub breaker_states: std::collections::HashMap<String, String>,

    /// Routing calls attempted.
    pub total_requests: u64,

    /// Completions reported successful via `record_outcome`.
    pub successful_requests: u64,

    /// Completions reported failed via `record_outcome`.
    pub failed_requests: u64,

    /// Routing calls that exhausted every candidate.
    pub routing_failures: u64,

    /// Instance count per region.
    pub region_distribution: std::collections::HashMap<String, usize>,
}

/// The request router.
pub struct Router {
    registry: Arc<ServerRegistry>,
    strategy: Box<dyn SelectionStrategy>,
    sticky: Option<StickySessions>,
    max_retries: u32,

    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    routing_failures: AtomicU64,
}

impl Router {
    /// Create a router with the given strategy, fixed for the router's
    /// lifetime. Sticky sessions are enabled per `config.session_affinity`.
    pub fn new(
        registry: Arc<ServerRegistry>,
        strategy: Box<dyn SelectionStrategy>,
        store: Arc<dyn SharedStore>,
        config: &RouterConfig,
    ) -> Self {
        let sticky = config.session_affinity.then(|| StickySessions {
            store,
            ttl: config.session_ttl,
        });

        Self {
            registry,
            strategy,
            sticky,
            max_retries: config.max_retries,
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            routing_failures: AtomicU64::new(0),
        }
    }

    /// Route one request to a backend instance.
    ///
    /// On success the instance has been admitted (load and connections
    /// incremented) and, when session affinity applies, the sticky mapping
    /// recorded. On failure the caller sees the last concrete error, or
    /// `NoHealthyServers` when no candidate existed at all.
    pub async fn route_request(&self, ctx: &RequestContext) -> BalancerResult<RouteDecision> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter!("router_requests_total").increment(1);
        let started = Instant::now();

        // Sticky fast path: honor an existing mapping when the referenced
        // server is still present and healthy.
        if let (Some(sticky), Some(session_id)) = (&self.sticky, &ctx.session_id) {
            if let Some(server_id) = sticky.lookup(session_id).await {
                match self.registry.get(&server_id) {
                    Some(server) if server.is_healthy() => {
                        server.admit();
                        counter!("router_sticky_hits").increment(1);
                        debug!(
                            request_id = %ctx.request_id,
                            session_id = %session_id,
                            server_id = %server.id,
                            "routed via sticky session"
                        );
                        return Ok(RouteDecision {
                            server,
                            retries: 0,
                            sticky_hit: true,
                        });
                    }
                    _ => {
                        // Mapped server gone or unhealthy: fall through to
                        // strategy selection; a new mapping is recorded below.
                        debug!(
                            request_id = %ctx.request_id,
                            session_id = %session_id,
                            server_id = %server_id,
                            "sticky mapping stale, reselecting"
                        );
                    }
                }
            }
        }

        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<BalancerError> = None;
        let mut retries = 0u32;

        for attempt in 0..=self.max_retries {
            let healthy: Vec<Arc<ServerInstance>> = self
                .registry
                .healthy_servers()
                .into_iter()
                .filter(|server| !excluded.contains(&server.id))
                .collect();

            let candidate = match self.strategy.select(&healthy, ctx).await {
                Some(index) => healthy[index].clone(),
                None => break,
            };

            let breaker = match self.registry.breaker(&candidate.id) {
                Some(breaker) => breaker,
                // Removed between selection and guard; treat like a rejection.
                None => {
                    excluded.insert(candidate.id.clone());
                    continue;
                }
            };

            match breaker.can_proceed() {
                Ok(()) => {
                    candidate.admit();
                    retries = attempt;

                    if let (Some(sticky), Some(session_id)) = (&self.sticky, &ctx.session_id) {
                        sticky.record(session_id, &candidate.id).await;
                    }

                    histogram!("router_selection_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    debug!(
                        request_id = %ctx.request_id,
                        server_id = %candidate.id,
                        strategy = self.strategy.name(),
                        retries,
                        "routed request"
                    );
                    return Ok(RouteDecision {
                        server: candidate,
                        retries,
                        sticky_hit: false,
                    });
                }
                Err(e) => {
                    debug!(
                        request_id = %ctx.request_id,
                        server_id = %candidate.id,
                        error = %e,
                        attempt,
                        "candidate rejected, retrying with exclusion"
                    );
                    excluded.insert(candidate.id.clone());
                    last_error = Some(e);
                }
            }
        }

        self.routing_failures.fetch_add(1, Ordering::Relaxed);
        counter!("router_routing_failures").increment(1);
        Err(last_error.unwrap_or(BalancerError::NoHealthyServers))
    }

    /// Completion callback from the caller: feeds the breaker, releases the
    /// admitted load, and folds the observed response time into the EWMA.
    ///
    /// Unknown server ids (e.g. drained mid-flight) are counted but otherwise
    /// ignored.
    pub fn record_outcome(&self, server_id: &str, success: bool, response_time_ms: Option<f64>) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(breaker) = self.registry.breaker(server_id) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        } else {
            debug!(server_id = %server_id, "outcome for unknown server");
            return;
        }

        if let Some(server) = self.registry.get(server_id) {
            server.release();
            if let Some(response_time_ms) = response_time_ms {
                server.observe_response_time(response_time_ms);
            }
        }
    }

    /// Fleet snapshot: per-instance state, breaker states, aggregate
    /// counters, and the region distribution.
    pub fn stats(&self) -> FleetStats {
        let servers = self.registry.snapshot();

        let mut region_distribution = std::collections::HashMap::new();
        for server in &servers {
            *region_distribution.entry(server.region.clone()).or_insert(0) += 1;
        }

        let breaker_states = self
            .registry
            .breaker_states()
            .into_iter()
            .map(|(id, state)| (id, state.label().to_string()))
            .collect();

        FleetStats {
            servers,
            breaker_states,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            region_distribution,
        }
    }

    /// Name of the active strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}
