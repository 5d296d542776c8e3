//! Prometheus metrics for the gateway relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, Counter, CounterVec, Gauge, GaugeVec, Histogram,
    HistogramVec,
};

lazy_static! {
    // Scanning
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "relayer_blocks_scanned_total",
        "Total number of source blocks scanned for gateway events",
        &["chain"]
    ).unwrap();

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "relayer_watermark_height",
        "Highest fully processed height per chain",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS: CounterVec = register_counter_vec!(
        "relayer_events_total",
        "Gateway events seen by the watchers",
        &["chain", "result"]
    ).unwrap();

    // Dispatch
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Execution attempts per destination chain and outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref REQUESTS_FINISHED: CounterVec = register_counter_vec!(
        "relayer_requests_finished_total",
        "Requests that reached a terminal status",
        &["chain", "status"]
    ).unwrap();

    pub static ref DISPATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_dispatch_latency_seconds",
        "Time from source confirmation to destination execution",
        &["chain"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Errors
    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "relayer_rpc_errors_total",
        "RPC failures per chain and kind",
        &["chain", "kind"]
    ).unwrap();

    // Loop
    pub static ref TICKS: Counter = register_counter!(
        "relayer_ticks_total",
        "Completed relay ticks"
    ).unwrap();

    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "relayer_tick_duration_seconds",
        "Wall time of one relay tick",
        vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relay loop is running"
    ).unwrap();
}

/// Record a scanned block range
pub fn record_blocks_scanned(chain: &str, from: u64, to: u64) {
    BLOCKS_SCANNED
        .with_label_values(&[chain])
        .inc_by(to.saturating_sub(from).saturating_add(1) as f64);
    WATERMARK.with_label_values(&[chain]).set(to as f64);
}

/// `result` is one of observed, duplicate, malformed, unroutable
pub fn record_event(chain: &str, result: &str) {
    EVENTS.with_label_values(&[chain, result]).inc();
}

pub fn record_submission(chain: &str, outcome: &str) {
    SUBMISSIONS.with_label_values(&[chain, outcome]).inc();
}

pub fn record_executed(chain: &str, latency_secs: f64) {
    REQUESTS_FINISHED.with_label_values(&[chain, "executed"]).inc();
    DISPATCH_LATENCY
        .with_label_values(&[chain])
        .observe(latency_secs.max(0.0));
}

pub fn record_failed(chain: &str) {
    REQUESTS_FINISHED.with_label_values(&[chain, "failed"]).inc();
}

pub fn record_rpc_error(chain: &str, kind: &str) {
    RPC_ERRORS.with_label_values(&[chain, kind]).inc();
}

pub fn record_tick(duration_secs: f64) {
    TICKS.inc();
    TICK_DURATION.observe(duration_secs);
}

pub fn set_up(up: bool) {
    UP.set(if up { 1.0 } else { 0.0 });
}
