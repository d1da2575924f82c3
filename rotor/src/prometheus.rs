// prometheus exporter setup

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub fn report_cycle_outcome(trigger: &'static str, outcome: &'static str) {
    counter!("rotor_cycles_total", "trigger" => trigger, "outcome" => outcome).increment(1);
}

pub fn report_cycle_duration(outcome: &'static str, seconds: f64) {
    histogram!("rotor_cycle_duration_seconds", "outcome" => outcome).record(seconds);
}

pub fn report_trigger_rejected() {
    counter!("rotor_triggers_rejected_total").increment(1);
}

pub fn report_pool_apply(result: &'static str) {
    counter!("rotor_pool_applies_total", "result" => result).increment(1);
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];
    const CYCLE_SECONDS: &[f64] = &[
        1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full("rotor_cycle_duration_seconds".to_string()),
            CYCLE_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}
