use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "proxy_requests_total",
            Unit::Count,
            "Total requests processed, by kind/method/status"
        );
        describe_histogram!(
            "proxy_request_duration_seconds",
            Unit::Seconds,
            "Request duration from the client perspective"
        );

        // rotation
        describe_gauge!(
            "proxy_rotation_candidates",
            Unit::Count,
            "Candidates in the active selector after the last refresh"
        );
        describe_counter!(
            "proxy_fallback_attempts_total",
            Unit::Count,
            "Attempts that re-selected an upstream after a failure"
        );
        describe_counter!(
            "proxy_upstream_results_total",
            Unit::Count,
            "Recorded upstream outcomes, by result"
        );

        // tunnels
        describe_counter!(
            "proxy_tunnels_total",
            Unit::Count,
            "CONNECT tunnels, by result"
        );
        describe_gauge!(
            "proxy_tunnels_active",
            Unit::Count,
            "CONNECT tunnels currently splicing"
        );

        // middleware
        describe_counter!(
            "proxy_auth_rejected_total",
            Unit::Count,
            "Requests rejected by proxy authentication"
        );
        describe_counter!(
            "proxy_client_rate_limit_total",
            Unit::Count,
            "Per-client rate limit verdicts"
        );

        // connections & config
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );
        describe_counter!(
            "proxy_settings_reloads_total",
            Unit::Count,
            "Settings reloads applied"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
