//! Relay self-metrics.
//!
//! Request counts are collected by a middleware layered over every route
//! and exposed next to the pushed groups on the telemetry path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;
use tracing::debug;

use pushgate_store::{MetricFamily, MetricType, Sample};

pub const BUILD_INFO_METRIC: &str = "pushgate_build_info";
pub const HTTP_REQUESTS_METRIC: &str = "pushgate_http_requests_total";

/// Per-route request counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    requests: Mutex<BTreeMap<(String, u16), u64>>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, handler: &str, code: u16) {
        *self
            .requests
            .lock()
            .entry((handler.to_string(), code))
            .or_insert(0) += 1;
    }

    /// Number of requests seen for `handler` answered with `code`.
    pub fn count(&self, handler: &str, code: u16) -> u64 {
        self.requests
            .lock()
            .get(&(handler.to_string(), code))
            .copied()
            .unwrap_or(0)
    }

    /// Build info and request counters as metric families.
    pub fn families(&self) -> Vec<MetricFamily> {
        let mut build_info = MetricFamily::new(BUILD_INFO_METRIC, MetricType::Gauge);
        build_info.help = Some("A metric with a constant '1' value labeled by version.".into());
        build_info.samples.push(Sample {
            name: BUILD_INFO_METRIC.to_string(),
            labels: [("version".to_string(), env!("CARGO_PKG_VERSION").to_string())].into(),
            value: 1.0,
            timestamp_ms: None,
        });

        let mut requests = MetricFamily::new(HTTP_REQUESTS_METRIC, MetricType::Counter);
        requests.help = Some("Total HTTP requests processed by the relay.".into());
        for ((handler, code), count) in self.requests.lock().iter() {
            requests.samples.push(Sample {
                name: HTTP_REQUESTS_METRIC.to_string(),
                labels: [
                    ("code".to_string(), code.to_string()),
                    ("handler".to_string(), handler.clone()),
                ]
                .into(),
                value: *count as f64,
                timestamp_ms: None,
            });
        }

        vec![build_info, requests]
    }
}

/// Counts each request under its matched route and logs it at debug.
pub async fn track_requests(
    State(stats): State<Arc<RelayStats>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let handler = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16();

    stats.record(&handler, status);
    debug!(
        %method,
        handler = %handler,
        status,
        elapsed_us = start.elapsed().as_micros() as u64,
        "request handled"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_handler_and_code() {
        let stats = RelayStats::new();
        stats.record("/metrics/job/{job}", 202);
        stats.record("/metrics/job/{job}", 202);
        stats.record("/metrics/job/{job}", 400);

        assert_eq!(stats.count("/metrics/job/{job}", 202), 2);
        assert_eq!(stats.count("/metrics/job/{job}", 400), 1);
        assert_eq!(stats.count("/-/healthy", 200), 0);
    }

    #[test]
    fn families_include_build_info() {
        let stats = RelayStats::new();
        stats.record("/-/ready", 200);
        let families = stats.families();

        assert_eq!(families[0].name, BUILD_INFO_METRIC);
        assert_eq!(
            families[0].samples[0].labels["version"],
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(families[1].samples.len(), 1);
        assert_eq!(families[1].samples[0].labels["handler"], "/-/ready");
        assert_eq!(families[1].samples[0].value, 1.0);
    }
}
