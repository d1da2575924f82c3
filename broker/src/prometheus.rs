// prometheus exporter setup

use metrics::counter;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub fn report_runtime_call(op: &'static str, result: &'static str) {
    counter!("broker_runtime_calls_total", "op" => op, "result" => result).increment(1);
}

pub fn report_rejection(cause: &'static str) {
    counter!("broker_requests_rejected_total", "cause" => cause).increment(1);
}

pub fn report_inspect_cache(result: &'static str) {
    counter!("broker_inspect_cache_total", "result" => result).increment(1);
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}
