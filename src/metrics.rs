use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use tracing::error;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "qms".to_string());

    // === HTTP surface ===

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("http_requests_total", "Number of HTTP requests by path and status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["path", "status"]
        ).unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latencies in seconds"
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["path"]
        ).unwrap();

    // === Engines ===

    pub static ref RATE_ALLOW_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rate_allow_total", "Rate-limit decisions by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["ok"]
        ).unwrap();

    pub static ref ALLOC_OPS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("alloc_ops_total", "Alloc engine operations by kind and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["op", "ok"]
        ).unwrap();

    // === Membership ===

    pub static ref GOSSIP_LIVE_MEMBERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("gossip_live_members", "Number of live members seen through gossip")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    prometheus::default_registry().register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(RATE_ALLOW_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(ALLOC_OPS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(GOSSIP_LIVE_MEMBERS.clone()))?;

    Ok(())
}

/// Gathers and encodes metrics in the Prometheus text exposition format.
pub fn gather_metrics_string(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
