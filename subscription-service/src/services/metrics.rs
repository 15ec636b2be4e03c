use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once (test
/// harnesses spawn several applications per process); only the first call
/// installs.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(err) => {
            tracing::warn!(error = %err, "Prometheus recorder already installed");
        }
    }
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Count one webhook event by type and reconciliation outcome.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    metrics::counter!(
        "subscription_webhook_events_total",
        "type" => event_type.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// A price id that resolved to no catalog entry. This is the monitoring
/// surface for silently mis-tiered subscriptions.
pub fn record_unknown_price_id(price_id: &str) {
    metrics::counter!(
        "subscription_unknown_price_id_total",
        "price_id" => price_id.to_string(),
    )
    .increment(1);
}

/// A profile mutation that failed persistently and was dead-lettered.
pub fn record_dead_letter(event_type: &str) {
    metrics::counter!(
        "subscription_dead_letters_total",
        "type" => event_type.to_string(),
    )
    .increment(1);
}
