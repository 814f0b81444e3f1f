// Prometheus metrics for the intake service

use arbiter_common::types::ExecutionResult;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_submissions_total",
        "Finalized submissions by language and verdict",
        &["language", "verdict"]
    )
    .expect("metric can be registered");
    pub static ref REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_rejections_total",
        "Submissions rejected before execution",
        &["reason"]
    )
    .expect("metric can be registered");
    pub static ref EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "arbiter_execution_duration_seconds",
        "Wall time from compile start to result, per language",
        &["language"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("metric can be registered");
    pub static ref IN_FLIGHT: IntGauge =
        register_int_gauge!("arbiter_in_flight", "Submissions currently holding a sandbox slot")
            .expect("metric can be registered");
}

pub fn record_result(result: &ExecutionResult) {
    SUBMISSIONS_TOTAL
        .with_label_values(&[&result.language, result.verdict.as_str()])
        .inc();
    EXECUTION_SECONDS
        .with_label_values(&[&result.language])
        .observe(result.elapsed_ms as f64 / 1000.0);
}

pub fn record_rejection(reason: &str) {
    REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
