//! # Metrics Collector
//!
//! Maintains the bounded time series of [`MetricSample`]s that the predictor
//! and the fleet scaler read. One sample is appended per polling interval;
//! the window is bounded both by an age horizon (24 h by default) and a hard
//! entry cap, with the oldest entries evicted first.
//!
//! When the source fails or the poll times out, a neutral fallback sample is
//! recorded instead, so the window always advances and downstream consumers
//! never see a gap where load silently looks stale.

use chrono::Utc;
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::CollectorConfig;
use crate::core::types::MetricSample;
use crate::telemetry::source::MetricsSource;

/// Bounded window of load samples plus the polling loop that fills it.
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    window: RwLock<VecDeque<MetricSample>>,
    config: CollectorConfig,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricsSource>, config: CollectorConfig) -> Self {
        Self {
            source,
            window: RwLock::new(VecDeque::with_capacity(config.max_entries.min(4096))),
            config,
        }
    }

    /// Start the polling loop. Runs until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                poll_interval = ?self.config.poll_interval,
                retention = ?self.config.retention,
                max_entries = self.config.max_entries,
                "metrics collector started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("metrics collector stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
        })
    }

    /// Poll the source once, falling back to a neutral sample on error or
    /// timeout.
    pub async fn poll_once(&self) {
        let sample = match timeout(self.config.source_timeout, self.source.sample()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(error = %e, "metrics source failed, recording fallback sample");
                MetricSample::fallback(Utc::now())
            }
            Err(_) => {
                warn!(
                    timeout = ?self.config.source_timeout,
                    "metrics source timed out, recording fallback sample"
                );
                MetricSample::fallback(Utc::now())
            }
        };

        self.record(sample);
    }

    /// Append a sample, clamping fields and enforcing both window bounds.
    pub fn record(&self, sample: MetricSample) {
        let sample = sample.clamped();

        gauge!("fleet_cpu_load").set(sample.cpu_load);
        gauge!("fleet_memory_usage").set(sample.memory_usage);
        gauge!("fleet_active_connections").set(f64::from(sample.active_connections));

        let mut window = self.window.write();
        window.push_back(sample);

        while window.len() > self.config.max_entries {
            window.pop_front();
        }

        // Age out entries past the retention horizon, measured against the
        // newest sample so replayed historical data behaves the same as live.
        if let Some(newest) = window.back().map(|s| s.timestamp) {
            let horizon = newest
                - chrono::Duration::from_std(self.config.retention)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            while window
                .front()
                .map(|s| s.timestamp < horizon)
                .unwrap_or(false)
            {
                window.pop_front();
            }
        }
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<MetricSample> {
        self.window.read().back().cloned()
    }

    /// The last `n` samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<MetricSample> {
        let window = self.window.read();
        window.iter().rev().take(n).rev().cloned().collect()
    }

    /// Full window copy, oldest first.
    pub fn history(&self) -> Vec<MetricSample> {
        self.window.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.read().is_empty()
    }
}
