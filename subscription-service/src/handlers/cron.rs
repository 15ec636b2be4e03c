//! Scheduled usage reset for free-tier accounts.
//!
//! Paid accounts reset on their own billing anniversary via
//! `invoice.payment_succeeded`; free accounts have no invoices, so a
//! calendar-monthly job zeroes them instead.

use anyhow::anyhow;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{DateTime, Datelike, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::utils::signature::constant_time_eq;

use crate::AppState;
use crate::services::store::{ProfileStore, ProfileUpdate};

const CRON_SECRET_HEADER: &str = "x-cron-secret";

#[derive(Debug, Default, Deserialize)]
pub struct ResetUsageRequest {
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetUsageResults {
    pub free_users_reset: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetUsageResponse {
    pub success: bool,
    pub message: String,
    pub results: ResetUsageResults,
    pub timestamp: String,
}

pub async fn reset_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ResetUsageRequest>>,
) -> Result<Json<ResetUsageResponse>, AppError> {
    let provided = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| body.and_then(|Json(b)| b.secret));

    let Some(provided) = provided else {
        return Err(AppError::Unauthorized(anyhow!("Missing cron secret")));
    };
    if !constant_time_eq(
        provided.as_bytes(),
        state.config.cron.secret.expose_secret().as_bytes(),
    ) {
        return Err(AppError::Unauthorized(anyhow!("Invalid cron secret")));
    }

    let now = Utc::now();
    let results = run_usage_reset(state.store.as_ref(), now)
        .await
        .map_err(AppError::InternalError)?;

    let message = if now.day() == 1 {
        format!(
            "Monthly usage reset complete: {} free accounts",
            results.free_users_reset
        )
    } else {
        "Usage reset only runs on the first day of the month".to_string()
    };

    Ok(Json(ResetUsageResponse {
        success: true,
        message,
        results,
        timestamp: now.to_rfc3339(),
    }))
}

/// Zero the usage counters of every free-tier profile, on the first of the
/// month only. One profile failing does not stop the sweep; failures are
/// counted and logged.
pub async fn run_usage_reset(
    store: &dyn ProfileStore,
    now: DateTime<Utc>,
) -> anyhow::Result<ResetUsageResults> {
    if now.day() != 1 {
        tracing::info!(day = now.day(), "Skipping usage reset; not the first of the month");
        return Ok(ResetUsageResults {
            free_users_reset: 0,
            errors: Vec::new(),
        });
    }

    let profiles = store.list_free_profiles().await?;
    let mut reset = 0;
    let mut errors = Vec::new();

    for profile in profiles {
        match store
            .apply_update(profile.id, ProfileUpdate::reset_usage_only())
            .await
        {
            Ok(()) => reset += 1,
            Err(err) => {
                tracing::error!(profile_id = %profile.id, email = %profile.email, error = %err, "Usage reset failed for profile");
                errors.push(format!("{}: {}", profile.email, err));
            }
        }
    }

    tracing::info!(reset, errors = errors.len(), "Monthly free-tier usage reset finished");
    Ok(ResetUsageResults {
        free_users_reset: reset,
        errors,
    })
}
