pub mod cron;
pub mod stripe;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::AppState;
use crate::services::metrics;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "subscription-service",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness probes the store with a cheap lookup; a failing backend flips
/// the service out of rotation without killing it.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    match state.store.find_by_id(Uuid::nil()).await {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn metrics_endpoint() -> String {
    metrics::get_metrics()
}
