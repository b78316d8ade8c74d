//! Metrics for log ingestion and recovery.
//!
//! Recording goes through the global `metrics` recorder, so the helpers are
//! no-ops until an exporter is installed with [`init_metrics`].

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{Error, Result};

/// Install the Prometheus exporter listening on `listen` and register metric
/// descriptions.
pub fn init_metrics(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| Error::Config(format!("failed to install Prometheus exporter: {e}")))?;

    describe_metrics();
    Ok(())
}

/// Register metric descriptions.
pub fn describe_metrics() {
    // Buffer
    describe_counter!("log_buffer_logs_enqueued_total", "Logs admitted to the buffer");
    describe_counter!(
        "log_buffer_logs_dropped_total",
        "Logs dropped because a window reached its limit"
    );
    describe_counter!(
        "log_buffer_logs_expired_total",
        "Logs evicted for falling behind the lookback threshold"
    );
    describe_counter!("log_buffer_logs_dequeued_total", "Logs pulled from the buffer");
    describe_counter!("log_buffer_reorgs_total", "Blocks evicted after a hash change");

    // Provider
    describe_counter!(
        "log_provider_read_batches_dropped_total",
        "Read batches dropped because the job queue was full"
    );
    describe_counter!(
        "log_provider_read_errors_total",
        "Filters whose log read failed"
    );
    describe_counter!("log_provider_payloads_total", "Payloads returned to callers");

    // Recoverer
    describe_counter!(
        "log_recoverer_logs_found_total",
        "Missed logs added to the pending queue"
    );
    describe_counter!(
        "log_recoverer_proposals_total",
        "Recovery proposals returned to callers"
    );
    describe_gauge!(
        "log_recoverer_pending_payloads",
        "Payloads waiting in the recovery pending queue"
    );
}

pub(crate) fn record_buffer_enqueue(added: usize, dropped: usize, expired: usize) {
    counter!("log_buffer_logs_enqueued_total").increment(added as u64);
    counter!("log_buffer_logs_dropped_total").increment(dropped as u64);
    counter!("log_buffer_logs_expired_total").increment(expired as u64);
}

pub(crate) fn record_buffer_dequeue(dequeued: usize) {
    counter!("log_buffer_logs_dequeued_total").increment(dequeued as u64);
}

pub(crate) fn record_reorg() {
    counter!("log_buffer_reorgs_total").increment(1);
}

pub(crate) fn record_read_batch_dropped() {
    counter!("log_provider_read_batches_dropped_total").increment(1);
}

pub(crate) fn record_read_errors(errors: usize) {
    counter!("log_provider_read_errors_total").increment(errors as u64);
}

pub(crate) fn record_payloads(payloads: usize) {
    counter!("log_provider_payloads_total").increment(payloads as u64);
}

pub(crate) fn record_recovered_logs(found: usize) {
    counter!("log_recoverer_logs_found_total").increment(found as u64);
}

pub(crate) fn record_recovery_proposals(proposals: usize) {
    counter!("log_recoverer_proposals_total").increment(proposals as u64);
}

pub(crate) fn set_pending_payloads(pending: usize) {
    gauge!("log_recoverer_pending_payloads").set(pending as f64);
}
