//! # Traffic Predictor
//!
//! Forecasts near-term demand from the collector's sample window. The
//! forecast for a target instant (now + horizon) is built from a cohort of
//! historical samples taken at a similar time of day (±1 h by default). Once
//! at least a week of history exists, the cohort is restricted to the same
//! day of week, so weekday and weekend patterns stop polluting each other.
//!
//! A short-term trend adjustment, the delta between the first and second
//! half of the most recent samples, is added on top of the cohort average so
//! a ramp that started minutes ago shows up in the forecast immediately.
//! Confidence grows with cohort size and is capped at 0.9; with insufficient
//! history the predictor degrades to the latest observed sample at low
//! confidence.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::core::config::PredictorConfig;
use crate::core::types::MetricSample;
use crate::telemetry::collector::MetricsCollector;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Forecasted demand at the prediction horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadForecast {
    /// Predicted CPU load, 0–1.
    pub cpu_load: f64,
    /// Predicted memory usage, 0–1.
    pub memory_usage: f64,
    /// Predicted active connections.
    pub active_connections: f64,
    /// Forecast confidence, 0.1–0.9.
    pub confidence: f64,
    /// Number of historical samples the forecast was averaged over; zero for
    /// the latest-sample fallback.
    pub cohort_size: usize,
}

impl LoadForecast {
    fn from_sample(sample: &MetricSample, confidence: f64) -> Self {
        Self {
            cpu_load: sample.cpu_load,
            memory_usage: sample.memory_usage,
            active_connections: f64::from(sample.active_connections),
            confidence,
            cohort_size: 0,
        }
    }

    fn empty() -> Self {
        Self {
            cpu_load: 0.0,
            memory_usage: 0.0,
            active_connections: 0.0,
            confidence: 0.1,
            cohort_size: 0,
        }
    }
}

/// Cohort-based demand forecaster.
pub struct TrafficPredictor {
    collector: Arc<MetricsCollector>,
    config: PredictorConfig,
}

impl TrafficPredictor {
    pub fn new(collector: Arc<MetricsCollector>, config: PredictorConfig) -> Self {
        Self { collector, config }
    }

    /// Forecast demand at `now + horizon` using the configured horizon.
    pub fn forecast(&self) -> LoadForecast {
        self.forecast_at(Utc::now())
    }

    /// Forecast demand at `now + horizon`. Taking `now` as a parameter keeps
    /// the cohort math deterministic under test.
    pub fn forecast_at(&self, now: DateTime<Utc>) -> LoadForecast {
        let history = self.collector.history();

        if history.is_empty() {
            return LoadForecast::empty();
        }

        if history.len() < self.config.min_history {
            return self.fallback(&history);
        }

        let horizon =
            chrono::Duration::from_std(self.config.horizon).unwrap_or_else(|_| {
                chrono::Duration::minutes(15)
            });
        let target = now + horizon;

        let cohort = self.select_cohort(&history, target);
        if cohort.is_empty() {
            debug!(
                history_len = history.len(),
                "no cohort at target time-of-day, using latest sample"
            );
            return self.fallback(&history);
        }

        let n = cohort.len() as f64;
        let mut cpu = cohort.iter().map(|s| s.cpu_load).sum::<f64>() / n;
        let mut memory = cohort.iter().map(|s| s.memory_usage).sum::<f64>() / n;
        let mut connections = cohort
            .iter()
            .map(|s| f64::from(s.active_connections))
            .sum::<f64>()
            / n;

        let trend = self.trend_adjustment();
        cpu = (cpu + trend.0).clamp(0.0, 1.0);
        memory = (memory + trend.1).clamp(0.0, 1.0);
        connections = (connections + trend.2).max(0.0);

        LoadForecast {
            cpu_load: cpu,
            memory_usage: memory,
            active_connections: connections,
            confidence: (0.3 + 0.05 * n).min(0.9),
            cohort_size: cohort.len(),
        }
    }

    /// Latest-sample passthrough with confidence scaled by how much history
    /// exists, 0.1–0.8.
    fn fallback(&self, history: &[MetricSample]) -> LoadForecast {
        let latest = match history.last() {
            Some(latest) => latest,
            None => return LoadForecast::empty(),
        };
        let fraction = (history.len() as f64 / self.config.min_history as f64).min(1.0);
        LoadForecast::from_sample(latest, 0.1 + 0.7 * fraction)
    }

    /// Samples at a similar time of day, and on the same weekday once the
    /// window spans at least `weekday_history`.
    fn select_cohort<'a>(
        &self,
        history: &'a [MetricSample],
        target: DateTime<Utc>,
    ) -> Vec<&'a MetricSample> {
        let window_secs = self.config.time_of_day_window.as_secs() as i64;
        let target_tod = seconds_of_day(target);

        let span = match (history.first(), history.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => chrono::Duration::zero(),
        };
        let filter_weekday = span
            >= chrono::Duration::from_std(self.config.weekday_history)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        history
            .iter()
            .filter(|sample| {
                time_of_day_distance(seconds_of_day(sample.timestamp), target_tod) <= window_secs
            })
            .filter(|sample| {
                !filter_weekday || sample.timestamp.weekday() == target.weekday()
            })
            .collect()
    }

    /// Delta between the second and first half of the most recent samples:
    /// positive when load is ramping up right now.
    fn trend_adjustment(&self) -> (f64, f64, f64) {
        let recent = self.collector.recent(self.config.trend_samples);
        if recent.len() < 4 {
            return (0.0, 0.0, 0.0);
        }

        let half = recent.len() / 2;
        let first = &recent[..half];
        let second = &recent[recent.len() - half..];

        let mean = |samples: &[MetricSample]| {
            let n = samples.len() as f64;
            (
                samples.iter().map(|s| s.cpu_load).sum::<f64>() / n,
                samples.iter().map(|s| s.memory_usage).sum::<f64>() / n,
                samples
                    .iter()
                    .map(|s| f64::from(s.active_connections))
                    .sum::<f64>()
                    / n,
            )
        };

        let (cpu_a, mem_a, conn_a) = mean(first);
        let (cpu_b, mem_b, conn_b) = mean(second);
        (cpu_b - cpu_a, mem_b - mem_a, conn_b - conn_a)
    }
}

fn seconds_of_day(ts: DateTime<Utc>) -> i64 {
    i64::from(ts.num_seconds_from_midnight())
}

/// Circular distance between two times of day, so 23:30 and 00:30 are one
/// hour apart rather than twenty-three.
fn time_of_day_distance(a: i64, b: i64) -> i64 {
    let diff = (a - b).abs();
    diff.min(SECONDS_PER_DAY - diff)
}
