//! Stripe-facing endpoints: the webhook, the fallback session verifier, and
//! the checkout/cancellation API used by the frontend.

use anyhow::anyhow;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use validator::Validate;

use crate::AppState;
use crate::services::events::StripeEvent;
use crate::services::reconciliation::{CheckoutOutcome, CheckoutTrigger};
use crate::services::stripe::verify_webhook_signature;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Webhook entry point. Authentication failures get 400 so the provider
/// retries; once the signature checks out, every event is acknowledged and
/// reconciliation failures are handled internally.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest(anyhow!("Missing webhook body")));
    }

    // The header is required even when verification is bypassed; its absence
    // means the request did not come from the provider at all.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest(anyhow!("Missing stripe-signature header")))?;

    match &state.config.stripe.webhook_secret {
        Some(secret) => {
            verify_webhook_signature(
                secret.expose_secret(),
                &body,
                signature,
                state.config.stripe.signature_tolerance_secs,
            )
            .map_err(|err| {
                tracing::warn!(error = %err, "Webhook signature verification failed");
                AppError::BadRequest(anyhow!("Webhook signature verification failed"))
            })?;
        }
        None => {
            tracing::warn!(
                "Webhook signing secret not configured; accepting event without verification"
            );
        }
    }

    let event = StripeEvent::from_slice(&body).map_err(AppError::BadRequest)?;
    tracing::info!(event_id = %event.id, event_type = %event.event_type, "Processing webhook event");

    let outcome = state.reconciler.handle_event(&event).await;
    tracing::debug!(event_id = %event.id, outcome = outcome.as_str(), "Webhook event handled");

    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    #[validate(length(min = 1, message = "sessionId is required"))]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionResponse {
    pub success: bool,
    pub tier: String,
    pub email: String,
    /// "webhook" when the event already applied, "fallback" when this call
    /// performed the update.
    pub source: &'static str,
}

/// Fallback verifier for the post-checkout redirect. Re-fetches the session
/// from the provider (client-supplied ids are never trusted) and applies the
/// same completion logic as the webhook when it has not run yet.
pub async fn verify_session(
    State(state): State<AppState>,
    Json(request): Json<VerifySessionRequest>,
) -> Result<Json<VerifySessionResponse>, AppError> {
    request.validate()?;

    let session = state
        .stripe
        .get_checkout_session(&request.session_id)
        .await
        .map_err(AppError::InternalError)?;

    if !session.is_paid() {
        return Err(AppError::BadRequest(anyhow!("Payment not completed")));
    }

    match state
        .reconciler
        .complete_checkout(&session, CheckoutTrigger::Fallback)
        .await
    {
        Ok(CheckoutOutcome::AlreadyProcessed { tier, email }) => Ok(Json(VerifySessionResponse {
            success: true,
            tier: tier.as_str().to_string(),
            email,
            source: "webhook",
        })),
        Ok(CheckoutOutcome::Applied { tier, email }) => Ok(Json(VerifySessionResponse {
            success: true,
            tier: tier.as_str().to_string(),
            email,
            source: "fallback",
        })),
        Ok(CheckoutOutcome::ProfileNotFound { email }) => Err(AppError::NotFound(anyhow!(
            "No profile found for {}",
            email
        ))),
        Ok(CheckoutOutcome::MissingEmail) => Err(AppError::BadRequest(anyhow!(
            "Checkout session has no customer email"
        ))),
        Err(err) => Err(AppError::InternalError(err)),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutSessionRequest {
    #[validate(email(message = "a valid email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "priceId is required"))]
    pub price_id: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutSessionResponse {
    pub session_id: String,
    pub url: Option<String>,
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutSessionRequest>,
) -> Result<Json<CreateCheckoutSessionResponse>, AppError> {
    request.validate()?;

    // Sessions are only created for prices the service can later resolve to
    // a tier; anything else would complete checkout into the free tier.
    if state.catalog.resolve_tier(&request.price_id).is_none() {
        return Err(AppError::BadRequest(anyhow!(
            "Unknown price id: {}",
            request.price_id
        )));
    }

    let success_url = request
        .success_url
        .as_deref()
        .unwrap_or(&state.config.stripe.checkout_success_url);
    let cancel_url = request
        .cancel_url
        .as_deref()
        .unwrap_or(&state.config.stripe.checkout_cancel_url);

    let session = state
        .stripe
        .create_checkout_session(&request.email, &request.price_id, success_url, cancel_url)
        .await
        .map_err(AppError::InternalError)?;

    tracing::info!(session_id = %session.id, email = %request.email, price_id = %request.price_id, "Checkout session created");

    Ok(Json(CreateCheckoutSessionResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelSubscriptionRequest {
    #[validate(email(message = "a valid email is required"))]
    pub email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSubscriptionResponse {
    pub success: bool,
    pub message: String,
    pub cancel_at: Option<String>,
    pub current_period_end: Option<String>,
}

fn epoch_to_rfc3339(secs: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.to_rfc3339())
}

/// Schedule cancellation at period end for the caller's subscription. The
/// profile is updated optimistically; the `customer.subscription.updated`
/// webhook converges it either way.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(request): Json<CancelSubscriptionRequest>,
) -> Result<Json<CancelSubscriptionResponse>, AppError> {
    request.validate()?;

    let profile = state
        .store
        .find_by_email(&request.email)
        .await
        .map_err(AppError::InternalError)?
        .ok_or_else(|| AppError::NotFound(anyhow!("No profile found for {}", request.email)))?;

    let subscription_id = profile
        .stripe_subscription_id
        .as_deref()
        .ok_or_else(|| AppError::NotFound(anyhow!("No active subscription for this account")))?;

    let subscription = state
        .stripe
        .cancel_at_period_end(subscription_id)
        .await
        .map_err(AppError::InternalError)?;

    let cancel_at = subscription.effective_cancel_at();

    if let Some(ts) = cancel_at {
        let update = crate::services::ProfileUpdate {
            subscription_cancel_at: Some(Some(mongodb::bson::DateTime::from_millis(ts * 1000))),
            ..Default::default()
        };
        if let Err(err) = state.store.apply_update(profile.id, update).await {
            tracing::warn!(profile_id = %profile.id, error = %err, "Failed to record scheduled cancellation locally");
        }
    }

    tracing::info!(email = %profile.email, subscription_id = %subscription.id, "Subscription cancellation scheduled");

    Ok(Json(CancelSubscriptionResponse {
        success: true,
        message: "Subscription will be canceled at the end of the billing period".to_string(),
        cancel_at: cancel_at.and_then(epoch_to_rfc3339),
        current_period_end: subscription
            .current_period_end
            .and_then(epoch_to_rfc3339),
    }))
}
