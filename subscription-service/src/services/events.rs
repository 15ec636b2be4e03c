//! Typed model of the provider webhook events this service reconciles.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Event types with reconciliation semantics. Everything else parses as
/// `Unknown` and is acknowledged without action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            _ => Self::Unknown,
        }
    }
}

/// Provider event envelope. The payload object stays untyped until the
/// handler for the specific event type extracts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

impl StripeEvent {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("Invalid webhook payload: {}", e))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    pub fn as_checkout_session(&self) -> Result<CheckoutSession> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| anyhow!("Event {} is not a checkout session: {}", self.id, e))
    }

    pub fn as_subscription(&self) -> Result<Subscription> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| anyhow!("Event {} is not a subscription: {}", self.id, e))
    }

    pub fn as_invoice(&self) -> Result<Invoice> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| anyhow!("Event {} is not an invoice: {}", self.id, e))
    }
}

/// Checkout session object, as delivered in `checkout.session.completed`
/// events and returned by the sessions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub line_items: Option<LineItems>,
    #[serde(default)]
    pub url: Option<String>,
}

impl CheckoutSession {
    /// Customer email, preferring the post-checkout details over the email
    /// the session was created with.
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
    }

    /// Price id from the first line item, falling back to the `price_id`
    /// metadata stamped at session creation (line items are not expanded on
    /// webhook payloads).
    pub fn price_id(&self) -> Option<&str> {
        self.line_items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
            .or_else(|| {
                self.metadata
                    .as_ref()
                    .and_then(|m| m.get("price_id"))
                    .and_then(|v| v.as_str())
            })
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItems {
    #[serde(default)]
    pub data: Vec<LineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
}

/// Provider subscription object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

impl Subscription {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Effective cancellation instant for a scheduled cancellation: the
    /// explicit `cancel_at` when present, else the end of the current period.
    pub fn effective_cancel_at(&self) -> Option<i64> {
        self.cancel_at.or(self.current_period_end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
}

/// Invoice object, only the fields renewal reconciliation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

/// Provider customer object, used to resolve an email for creation-type
/// events that only carry a customer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}
