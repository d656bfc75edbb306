//! # Selection Strategies
//!
//! Six algorithms for choosing a backend from the healthy set: round-robin,
//! least-connections, weighted round-robin, IP-hash, geographic, and
//! fastest-response.
//!
//! ## Contract
//!
//! Strategies only ever see instances already filtered to `healthy == true`,
//! in the registry's stable id order. An empty set returns `None` and the
//! router raises `NoHealthyServers`. Selection returns an index into the
//! passed slice; admission (incrementing load) is the router's job.
//!
//! The set of strategies is closed: [`StrategyKind`] is chosen once at router
//! construction and built into a trait object, so no string dispatch happens
//! on the request path.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::types::{RequestContext, ServerInstance};

/// Interface implemented by every selection algorithm.
///
/// Async to match the router's call path; the provided algorithms are
/// CPU-only, but the seam allows strategies that consult external state.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    /// Select an instance from the healthy set.
    ///
    /// Returns the index of the chosen instance in `healthy`, or `None` when
    /// the set is empty (or, for weighted draws, the degenerate case where no
    /// candidate can be chosen).
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        ctx: &RequestContext,
    ) -> Option<usize>;

    /// Algorithm name for logs and stats.
    fn name(&self) -> &'static str;
}

/// The closed set of selection algorithms, chosen at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    Geographic,
    FastestResponse,
}

impl StrategyKind {
    /// Build the strategy implementation for this variant.
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
            StrategyKind::LeastConnections => Box::new(LeastConnections),
            StrategyKind::WeightedRoundRobin => Box::new(WeightedRoundRobin),
            StrategyKind::IpHash => Box::new(IpHash),
            StrategyKind::Geographic => Box::new(Geographic),
            StrategyKind::FastestResponse => Box::new(FastestResponse),
        }
    }
}

/// Index of the healthy instance with the fewest active connections. Ties
/// break to the first occurrence in iteration order.
fn least_connections_index(servers: &[Arc<ServerInstance>]) -> Option<usize> {
    let mut min_connections = u32::MAX;
    let mut selected = None;
    for (index, server) in servers.iter().enumerate() {
        let connections = server.connections();
        if connections < min_connections {
            min_connections = connections;
            selected = Some(index);
        }
    }
    selected
}

/// Cyclic index over the healthy set, advanced on every call.
///
/// The counter is process-local and wraps modulo the current healthy-set
/// size, so N consecutive selections over a stable set of N instances touch
/// each instance exactly once.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SelectionStrategy for RoundRobin {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        _ctx: &RequestContext,
    ) -> Option<usize> {
        if healthy.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(index)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Arg-min over active connections.
pub struct LeastConnections;

#[async_trait]
impl SelectionStrategy for LeastConnections {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        _ctx: &RequestContext,
    ) -> Option<usize> {
        least_connections_index(healthy)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Cumulative-weight random draw where weight is the remaining capacity.
///
/// An instance at or over capacity still carries weight 1, so no instance is
/// ever fully starved.
pub struct WeightedRoundRobin;

#[async_trait]
impl SelectionStrategy for WeightedRoundRobin {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        _ctx: &RequestContext,
    ) -> Option<usize> {
        if healthy.is_empty() {
            return None;
        }

        let weights: Vec<u64> = healthy
            .iter()
            .map(|server| u64::from(server.effective_weight()))
            .collect();
        let total: u64 = weights.iter().sum();

        let mut draw = rand::thread_rng().gen_range(0..total);
        for (index, weight) in weights.iter().enumerate() {
            if draw < *weight {
                debug!(
                    server_id = %healthy[index].id,
                    weight,
                    algorithm = "weighted_round_robin",
                    "selected instance by weight"
                );
                return Some(index);
            }
            draw -= weight;
        }
        // Unreachable: draw < total and the weights sum to total.
        None
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Deterministic hash of the client IP modulo the healthy-set size.
///
/// The same client IP maps to the same instance for as long as the healthy
/// set is unchanged; affinity breaks on any membership change. Callers who
/// need durable affinity should use sticky sessions instead.
pub struct IpHash;

impl IpHash {
    fn hash_ip(ip: &std::net::IpAddr) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(ip.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        u64::from_be_bytes(bytes)
    }
}

#[async_trait]
impl SelectionStrategy for IpHash {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        ctx: &RequestContext,
    ) -> Option<usize> {
        if healthy.is_empty() {
            return None;
        }
        let index = (Self::hash_ip(&ctx.client_ip) % healthy.len() as u64) as usize;
        Some(index)
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

/// Least-connections within the request's region, falling back to global
/// least-connections when no instance matches the region (or the request
/// carries none).
pub struct Geographic;

#[async_trait]
impl SelectionStrategy for Geographic {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        ctx: &RequestContext,
    ) -> Option<usize> {
        if let Some(region) = &ctx.region {
            let regional: Vec<usize> = healthy
                .iter()
                .enumerate()
                .filter(|(_, server)| &server.region == region)
                .map(|(index, _)| index)
                .collect();

            if !regional.is_empty() {
                let regional_servers: Vec<Arc<ServerInstance>> = regional
                    .iter()
                    .map(|&index| healthy[index].clone())
                    .collect();
                return least_connections_index(&regional_servers)
                    .map(|local| regional[local]);
            }
            debug!(
                region = %region,
                algorithm = "geographic",
                "no regional match, falling back to global least-connections"
            );
        }
        least_connections_index(healthy)
    }

    fn name(&self) -> &'static str {
        "geographic"
    }
}

/// Arg-min over the smoothed response time.
pub struct FastestResponse;

#[async_trait]
impl SelectionStrategy for FastestResponse {
    async fn select(
        &self,
        healthy: &[Arc<ServerInstance>],
        _ctx: &RequestContext,
    ) -> Option<usize> {
        let mut best_time = f64::INFINITY;
        let mut selected = None;
        for (index, server) in healthy.iter().enumerate() {
            let response_time = server.response_time_ms();
            if response_time < best_time {
                best_time = response_time;
                selected = Some(index);
            }
        }
        selected
    }

    fn name(&self) -> &'static str {
        "fastest_response"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ServerSpec;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn servers(n: usize) -> Vec<Arc<ServerInstance>> {
        (0..n)
            .map(|i| {
                Arc::new(ServerInstance::from_spec(ServerSpec::with_id(
                    format!("srv-{}", i),
                    format!("http://10.0.0.{}", i),
                    "us-east",
                    10,
                )))
            })
            .collect()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
    }

    #[tokio::test]
    async fn test_every_strategy_returns_none_on_empty_set() {
        let empty: Vec<Arc<ServerInstance>> = Vec::new();
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::LeastConnections,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::IpHash,
            StrategyKind::Geographic,
            StrategyKind::FastestResponse,
        ] {
            let strategy = kind.build();
            assert_eq!(strategy.select(&empty, &ctx()).await, None, "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_server_once_per_cycle() {
        let pool = servers(4);
        let strategy = RoundRobin::new();

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(strategy.select(&pool, &ctx()).await.unwrap());
        }
        assert_eq!(seen.len(), 4);

        // Next cycle starts over from the beginning.
        assert_eq!(strategy.select(&pool, &ctx()).await, Some(0));
    }

    #[tokio::test]
    async fn test_least_connections_picks_minimum() {
        let pool = servers(3);
        for _ in 0..5 {
            pool[0].admit();
        }
        for _ in 0..2 {
            pool[1].admit();
        }
        for _ in 0..8 {
            pool[2].admit();
        }

        let strategy = LeastConnections;
        assert_eq!(strategy.select(&pool, &ctx()).await, Some(1));
    }

    #[tokio::test]
    async fn test_least_connections_tie_breaks_to_first() {
        let pool = servers(3);
        let strategy = LeastConnections;
        // All zero: first occurrence wins.
        assert_eq!(strategy.select(&pool, &ctx()).await, Some(0));
    }

    #[tokio::test]
    async fn test_weighted_never_starves_saturated_instance() {
        let pool = servers(2);
        // Saturate the first instance; its effective weight floors at 1.
        for _ in 0..10 {
            pool[0].admit();
        }

        let strategy = WeightedRoundRobin;
        let mut selected_first = false;
        for _ in 0..500 {
            if strategy.select(&pool, &ctx()).await == Some(0) {
                selected_first = true;
                break;
            }
        }
        assert!(selected_first, "saturated instance must still be selectable");
    }

    #[tokio::test]
    async fn test_ip_hash_is_deterministic_while_set_is_stable() {
        let pool = servers(5);
        let strategy = IpHash;
        let context = ctx();

        let first = strategy.select(&pool, &context).await.unwrap();
        for _ in 0..10 {
            assert_eq!(strategy.select(&pool, &context).await, Some(first));
        }

        // A different client may land elsewhere, but is itself stable.
        let other = RequestContext::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 42)));
        let other_first = strategy.select(&pool, &other).await.unwrap();
        assert_eq!(strategy.select(&pool, &other).await, Some(other_first));
    }

    #[tokio::test]
    async fn test_geographic_prefers_region_then_falls_back() {
        let pool = vec![
            Arc::new(ServerInstance::from_spec(ServerSpec::with_id(
                "srv-0", "http://a", "us-east", 10,
            ))),
            Arc::new(ServerInstance::from_spec(ServerSpec::with_id(
                "srv-1", "http://b", "eu-west", 10,
            ))),
            Arc::new(ServerInstance::from_spec(ServerSpec::with_id(
                "srv-2", "http://c", "eu-west", 10,
            ))),
        ];
        // Regional candidates carry load; the less-loaded one wins.
        pool[1].admit();
        pool[1].admit();
        pool[2].admit();

        let strategy = Geographic;

        let eu = ctx().with_region("eu-west");
        assert_eq!(strategy.select(&pool, &eu).await, Some(2));

        // No regional match: global least-connections.
        let ap = ctx().with_region("ap-south");
        assert_eq!(strategy.select(&pool, &ap).await, Some(0));

        // No region on the request at all: global least-connections.
        assert_eq!(strategy.select(&pool, &ctx()).await, Some(0));
    }

    #[tokio::test]
    async fn test_fastest_response_picks_lowest_ewma() {
        let pool = servers(3);
        pool[0].observe_response_time(120.0);
        pool[1].observe_response_time(35.0);
        pool[2].observe_response_time(80.0);

        let strategy = FastestResponse;
        assert_eq!(strategy.select(&pool, &ctx()).await, Some(1));
    }
}
