//! Prometheus metrics for the job pipeline
//!
//! Tracks:
//! - Job lifecycle (submitted, finished by outcome, queue depth, active jobs)
//! - Stage performance (fetch, mux, delivery durations)
//! - Fetch health (retries, requeues, bytes transferred)
//!
//! Registration happens on first access against the default registry, so
//! `prometheus::gather()` in the metrics server sees everything here.

// Metric names and label sets are compile-time constants; registration can
// only fail on a duplicate name, which would be a programming error.
#![allow(clippy::unwrap_used)]

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, register_int_gauge, Counter, CounterVec,
    HistogramVec, IntGauge,
};

/// Jobs accepted by the queue
pub static JOBS_SUBMITTED_TOTAL: Lazy<Counter> =
    Lazy::new(|| register_counter!("grabbot_jobs_submitted_total", "Total number of submitted jobs").unwrap());

/// Jobs that reached a terminal state
/// Labels: outcome (completed/failed/cancelled), reason (failure category or "none")
pub static JOBS_FINISHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "grabbot_jobs_finished_total",
        "Total number of jobs that reached a terminal state",
        &["outcome", "reason"]
    )
    .unwrap()
});

/// Time spent in each pipeline stage
/// Labels: stage (fetch/mux/deliver)
pub static STAGE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "grabbot_stage_duration_seconds",
        "Time spent per pipeline stage",
        &["stage"],
        vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .unwrap()
});

/// Fetch retries after network interruptions
pub static FETCH_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "grabbot_fetch_retries_total",
        "Fetch attempts retried after a network interruption"
    )
    .unwrap()
});

/// Jobs put back in the queue after a rate limit
pub static JOB_REQUEUES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("grabbot_job_requeues_total", "Jobs re-queued after a rate limit").unwrap()
});

/// Bytes written to temp storage by the fetcher
pub static FETCHED_BYTES_TOTAL: Lazy<Counter> =
    Lazy::new(|| register_counter!("grabbot_fetched_bytes_total", "Bytes fetched from remote sources").unwrap());

/// Jobs waiting for an admission slot
pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("grabbot_queue_depth", "Jobs waiting for an admission slot").unwrap());

/// Jobs holding an admission slot
pub static ACTIVE_JOBS: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("grabbot_active_jobs", "Jobs currently holding a worker slot").unwrap());

/// Registers every metric up front so `/metrics` lists them before the
/// first job runs.
pub fn init_metrics() {
    Lazy::force(&JOBS_SUBMITTED_TOTAL);
    Lazy::force(&JOBS_FINISHED_TOTAL);
    Lazy::force(&STAGE_DURATION_SECONDS);
    Lazy::force(&FETCH_RETRIES_TOTAL);
    Lazy::force(&JOB_REQUEUES_TOTAL);
    Lazy::force(&FETCHED_BYTES_TOTAL);
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&ACTIVE_JOBS);
    log::info!("Metrics registry initialized");
}

pub fn record_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_finished(outcome: &str, reason: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[outcome, reason]).inc();
}

pub fn record_stage_duration(stage: &str, seconds: f64) {
    STAGE_DURATION_SECONDS.with_label_values(&[stage]).observe(seconds);
}

pub fn record_fetch_retry() {
    FETCH_RETRIES_TOTAL.inc();
}

pub fn record_requeue() {
    JOB_REQUEUES_TOTAL.inc();
}

pub fn record_fetched_bytes(bytes: u64) {
    FETCHED_BYTES_TOTAL.inc_by(bytes as f64);
}

pub fn update_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn update_active_jobs(active: usize) {
    ACTIVE_JOBS.set(i64::try_from(active).unwrap_or(i64::MAX));
}
