//! # Metrics Source
//!
//! Boundary to the external system-metrics endpoint. The collector polls the
//! source on a fixed interval; any failure or timeout here is absorbed by the
//! collector with a fallback sample, never propagated further.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::MetricSample;

/// A pollable source of fleet load metrics.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Take one measurement. Implementations should be bounded; the collector
    /// additionally enforces its own poll timeout.
    async fn sample(&self) -> BalancerResult<MetricSample>;
}

/// Wire format returned by the HTTP metrics endpoint. Missing fields default
/// to zero rather than failing the poll.
#[derive(Debug, Deserialize)]
struct MetricsPayload {
    #[serde(default)]
    cpu_load: f64,
    #[serde(default)]
    memory_usage: f64,
    #[serde(default)]
    active_connections: u32,
    #[serde(default)]
    request_rate: f64,
    #[serde(default)]
    error_rate: f64,
    #[serde(default)]
    response_time_ms: f64,
}

/// Metrics source backed by a polled HTTP endpoint.
pub struct HttpMetricsSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMetricsSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn sample(&self) -> BalancerResult<MetricSample> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| BalancerError::metrics_unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BalancerError::metrics_unavailable(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let payload: MetricsPayload = response
            .json()
            .await
            .map_err(|e| BalancerError::metrics_unavailable(e.to_string()))?;

        Ok(MetricSample {
            timestamp: Utc::now(),
            cpu_load: payload.cpu_load,
            memory_usage: payload.memory_usage,
            active_connections: payload.active_connections,
            request_rate: payload.request_rate,
            error_rate: payload.error_rate,
            response_time_ms: payload.response_time_ms,
        }
        .clamped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_source_parses_and_clamps() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cpu_load": 1.4,
                "memory_usage": 0.5,
                "active_connections": 120,
                "request_rate": 80.0,
                "error_rate": 0.01,
                "response_time_ms": 42.0
            })))
            .mount(&mock)
            .await;

        let source = HttpMetricsSource::new(format!("{}/metrics", mock.uri()));
        let sample = source.sample().await.unwrap();

        assert_eq!(sample.cpu_load, 1.0);
        assert_eq!(sample.memory_usage, 0.5);
        assert_eq!(sample.active_connections, 120);
    }

    #[tokio::test]
    async fn test_http_source_tolerates_missing_fields() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"cpu_load": 0.3})),
            )
            .mount(&mock)
            .await;

        let source = HttpMetricsSource::new(format!("{}/metrics", mock.uri()));
        let sample = source.sample().await.unwrap();
        assert_eq!(sample.cpu_load, 0.3);
        assert_eq!(sample.request_rate, 0.0);
    }

    #[tokio::test]
    async fn test_http_source_errors_on_server_failure() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let source = HttpMetricsSource::new(format!("{}/metrics", mock.uri()));
        assert!(matches!(
            source.sample().await,
            Err(BalancerError::MetricsUnavailable { .. })
        ));
    }
}
