//! Stripe REST client and webhook signature verification.
//!
//! The client covers the handful of provider calls reconciliation needs:
//! retrieving checkout sessions, subscriptions and customers, creating
//! checkout sessions, and scheduling cancellation.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::utils::signature::{constant_time_eq, hmac_sha256_hex};
use thiserror::Error;

use crate::config::StripeConfig;
use crate::services::events::{CheckoutSession, Customer, Subscription};

/// Webhook authentication failures. All of these map to HTTP 400 at the
/// webhook endpoint; no mutation is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing stripe signature header")]
    MissingSignature,
    #[error("missing webhook body")]
    MissingBody,
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),
    #[error("webhook signature mismatch")]
    InvalidSignature,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
}

/// Verify a `Stripe-Signature` header against the exact raw request bytes.
///
/// The header carries `t=<unix>,v1=<hex>[,v1=<hex>...]`; the signed payload
/// is `"{t}.{raw_body}"`. Comparison is constant-time against every `v1`
/// candidate (the provider sends several during secret rotation).
pub fn verify_webhook_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    verify_webhook_signature_at(secret, payload, header, tolerance_secs, now)
}

/// As [`verify_webhook_signature`], with an injectable clock.
pub fn verify_webhook_signature_at(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now_epoch: i64,
) -> Result<(), SignatureError> {
    if payload.is_empty() {
        return Err(SignatureError::MissingBody);
    }
    if header.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for element in header.split(',') {
        match element.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse()
                        .map_err(|_| SignatureError::MalformedHeader(header.to_string()))?,
                );
            }
            Some(("v1", value)) => candidates.push(value),
            Some(_) => {} // v0 and future schemes are ignored
            None => return Err(SignatureError::MalformedHeader(header.to_string())),
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::MalformedHeader(header.to_string()))?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader(header.to_string()));
    }

    if (now_epoch - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    let timestamp_str = timestamp.to_string();
    let expected = hmac_sha256_hex(
        secret.as_bytes(),
        &[timestamp_str.as_bytes(), b".", payload],
    )
    .map_err(|_| SignatureError::InvalidSignature)?;

    if candidates
        .iter()
        .any(|candidate| constant_time_eq(expected.as_bytes(), candidate.as_bytes()))
    {
        Ok(())
    } else {
        Err(SignatureError::InvalidSignature)
    }
}

/// Sign a payload the way the provider does. Used by outbound-facing tests
/// and local tooling; production events arrive already signed.
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> Result<String> {
    let timestamp_str = timestamp.to_string();
    let tag = hmac_sha256_hex(
        secret.as_bytes(),
        &[timestamp_str.as_bytes(), b".", payload],
    )?;
    Ok(format!("t={},v1={}", timestamp, tag))
}

/// Stripe API error body.
#[derive(Debug, Deserialize)]
struct StripeApiError {
    error: StripeApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeApiErrorDetail {
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Thin client over the provider REST API.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    /// Retrieve a checkout session with line items expanded, so the price id
    /// is available without a second call.
    pub async fn get_checkout_session(&self, session_id: &str) -> Result<CheckoutSession> {
        let url = format!(
            "{}/checkout/sessions/{}?expand[]=line_items",
            self.config.api_base_url, session_id
        );
        self.get_json(&url, "checkout session").await
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        let url = format!(
            "{}/subscriptions/{}",
            self.config.api_base_url, subscription_id
        );
        self.get_json(&url, "subscription").await
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<Customer> {
        let url = format!("{}/customers/{}", self.config.api_base_url, customer_id);
        self.get_json(&url, "customer").await
    }

    /// Create a subscription-mode checkout session for one price. The price
    /// id is stamped into metadata so the webhook can resolve the tier even
    /// without expanded line items.
    pub async fn create_checkout_session(
        &self,
        email: &str,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession> {
        if !self.is_configured() {
            return Err(anyhow!("Stripe credentials not configured"));
        }

        let url = format!("{}/checkout/sessions", self.config.api_base_url);
        let form = [
            ("mode", "subscription"),
            ("payment_method_types[0]", "card"),
            ("line_items[0][price]", price_id),
            ("line_items[0][quantity]", "1"),
            ("customer_email", email),
            ("metadata[price_id]", price_id),
            ("success_url", success_url),
            ("cancel_url", cancel_url),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .form(&form)
            .send()
            .await?;

        self.decode(response, "checkout session creation").await
    }

    /// Schedule cancellation at period end. Access is retained until the
    /// terminal `customer.subscription.deleted` event arrives.
    pub async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<Subscription> {
        if !self.is_configured() {
            return Err(anyhow!("Stripe credentials not configured"));
        }

        let url = format!(
            "{}/subscriptions/{}",
            self.config.api_base_url, subscription_id
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .form(&[("cancel_at_period_end", "true")])
            .send()
            .await?;

        self.decode(response, "subscription cancellation").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        if !self.is_configured() {
            return Err(anyhow!("Stripe credentials not configured"));
        }

        let response = self
            .client
            .get(url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .send()
            .await?;

        self.decode(response, what).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, what = %what, "Stripe API response");

        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            let detail = serde_json::from_str::<StripeApiError>(&body)
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.error.error_type.unwrap_or_else(|| "api_error".to_string()),
                        e.error.message.unwrap_or_default()
                    )
                })
                .unwrap_or(body);
            tracing::error!(status = %status, what = %what, error = %detail, "Stripe API call failed");
            Err(anyhow!("Stripe {} failed ({}): {}", what, status, detail))
        }
    }
}
