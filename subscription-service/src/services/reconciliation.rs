//! The reconciliation engine: maps provider subscription/invoice events to
//! profile mutations.
//!
//! Creation-type events are keyed by email; everything after that is keyed by
//! the provider subscription id, which survives email changes. Cancellation
//! is two-phase: `customer.subscription.updated` with cancel-at-period-end
//! only schedules it (access retained), and the terminal
//! `customer.subscription.deleted` revokes access and clears usage.

use std::sync::Arc;

use anyhow::Result;
use mongodb::bson::DateTime;

use crate::models::{DeadLetterRecord, PremiumTier};
use crate::services::catalog::PlanCatalog;
use crate::services::events::{CheckoutSession, EventKind, Invoice, StripeEvent, Subscription};
use crate::services::metrics;
use crate::services::store::{ProfileStore, ProfileUpdate};
use crate::services::stripe::StripeClient;
use uuid::Uuid;

/// What a single event delivery amounted to. Every outcome except a
/// signature failure is acknowledged to the provider; retrying cannot fix a
/// missing profile, and a failed persistence attempt is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    AlreadyProcessed,
    ProfileNotFound,
    Ignored,
    Failed,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::AlreadyProcessed => "already_processed",
            ReconcileOutcome::ProfileNotFound => "profile_not_found",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::Failed => "failed",
        }
    }
}

/// Which entry point asked for a checkout completion. Only the webhook path
/// dead-letters failed mutations; the fallback path surfaces the error to
/// its caller instead.
#[derive(Debug, Clone)]
pub enum CheckoutTrigger {
    Webhook { event_id: String },
    Fallback,
}

/// Result of [`Reconciler::complete_checkout`], shared by the webhook and
/// fallback verification paths.
#[derive(Debug, Clone)]
pub enum CheckoutOutcome {
    /// The webhook already linked this subscription; nothing was written.
    AlreadyProcessed { tier: PremiumTier, email: String },
    /// The profile was granted the resolved tier.
    Applied { tier: PremiumTier, email: String },
    ProfileNotFound { email: String },
    MissingEmail,
}

fn epoch_to_datetime(secs: i64) -> DateTime {
    DateTime::from_millis(secs * 1000)
}

/// The shared checkout-completion mutation. Both entry points converge here
/// so the two code paths cannot drift.
pub fn checkout_completion_update(
    tier: PremiumTier,
    subscription_id: Option<String>,
    customer_id: Option<String>,
    period_start: Option<DateTime>,
    period_end: Option<DateTime>,
) -> ProfileUpdate {
    ProfileUpdate {
        premium_status: Some(true),
        premium_tier: Some(tier),
        stripe_subscription_id: subscription_id.map(Some),
        stripe_customer_id: customer_id.map(Some),
        current_period_start: period_start.map(Some),
        current_period_end: period_end.map(Some),
        subscription_cancel_at: None,
        reset_usage: false,
    }
}

#[derive(Clone)]
pub struct Reconciler {
    catalog: PlanCatalog,
    store: Arc<dyn ProfileStore>,
    stripe: StripeClient,
}

impl Reconciler {
    pub fn new(catalog: PlanCatalog, store: Arc<dyn ProfileStore>, stripe: StripeClient) -> Self {
        Self {
            catalog,
            store,
            stripe,
        }
    }

    /// Dispatch one verified event. Internal failures are logged (and
    /// dead-lettered where a mutation was attempted) but never propagate:
    /// the webhook endpoint acknowledges every verified event to avoid
    /// provider retry storms on unrecoverable errors.
    pub async fn handle_event(&self, event: &StripeEvent) -> ReconcileOutcome {
        let outcome = match event.kind() {
            EventKind::CheckoutSessionCompleted => match event.as_checkout_session() {
                Ok(session) => self.on_checkout_completed(event, &session).await,
                Err(err) => {
                    tracing::error!(event_id = %event.id, error = %err, "Malformed checkout session payload");
                    ReconcileOutcome::Failed
                }
            },
            EventKind::SubscriptionCreated => match event.as_subscription() {
                Ok(sub) => self.on_subscription_created(event, &sub).await,
                Err(err) => {
                    tracing::error!(event_id = %event.id, error = %err, "Malformed subscription payload");
                    ReconcileOutcome::Failed
                }
            },
            EventKind::SubscriptionUpdated => match event.as_subscription() {
                Ok(sub) => self.on_subscription_updated(event, &sub).await,
                Err(err) => {
                    tracing::error!(event_id = %event.id, error = %err, "Malformed subscription payload");
                    ReconcileOutcome::Failed
                }
            },
            EventKind::SubscriptionDeleted => match event.as_subscription() {
                Ok(sub) => self.on_subscription_deleted(event, &sub).await,
                Err(err) => {
                    tracing::error!(event_id = %event.id, error = %err, "Malformed subscription payload");
                    ReconcileOutcome::Failed
                }
            },
            EventKind::InvoicePaymentSucceeded => match event.as_invoice() {
                Ok(invoice) => self.on_invoice_payment_succeeded(event, &invoice).await,
                Err(err) => {
                    tracing::error!(event_id = %event.id, error = %err, "Malformed invoice payload");
                    ReconcileOutcome::Failed
                }
            },
            EventKind::Unknown => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                ReconcileOutcome::Ignored
            }
        };

        metrics::record_webhook_event(&event.event_type, outcome.as_str());
        outcome
    }

    /// Grant premium after a confirmed checkout. Shared with the fallback
    /// verifier, which calls it with [`CheckoutTrigger::Fallback`].
    pub async fn complete_checkout(
        &self,
        session: &CheckoutSession,
        trigger: CheckoutTrigger,
    ) -> Result<CheckoutOutcome> {
        let Some(email) = session.email() else {
            tracing::error!(session_id = %session.id, "No customer email found in session");
            return Ok(CheckoutOutcome::MissingEmail);
        };

        let Some(profile) = self.store.find_by_email(email).await? else {
            tracing::warn!(email = %email, session_id = %session.id, "User not found for checkout session");
            return Ok(CheckoutOutcome::ProfileNotFound {
                email: email.to_string(),
            });
        };

        // If the webhook already linked this subscription there is nothing
        // to write; racing deliveries converge on the same state.
        if profile.premium_status
            && session.subscription.is_some()
            && profile.stripe_subscription_id == session.subscription
        {
            tracing::info!(email = %email, tier = %profile.premium_tier.as_str(), "Profile already updated for this checkout");
            return Ok(CheckoutOutcome::AlreadyProcessed {
                tier: profile.premium_tier,
                email: email.to_string(),
            });
        }

        let tier = self.resolve_tier_or_free(session.price_id());

        // Period dates are enrichment; a provider lookup failure must not
        // block the tier grant.
        let (period_start, period_end) = match &session.subscription {
            Some(subscription_id) => self.fetch_period(subscription_id).await,
            None => (None, None),
        };

        let update = checkout_completion_update(
            tier,
            session.subscription.clone(),
            session.customer.clone(),
            period_start,
            period_end,
        );

        if let Err(err) = self.store.apply_update(profile.id, update.clone()).await {
            tracing::error!(
                profile_id = %profile.id,
                email = %email,
                tier = %tier.as_str(),
                error = %err,
                "Failed to update user profile after checkout"
            );
            if let CheckoutTrigger::Webhook { event_id } = &trigger {
                self.dead_letter(
                    event_id,
                    "checkout.session.completed",
                    Some(profile.id),
                    email,
                    update,
                    &err,
                )
                .await;
            }
            return Err(err);
        }

        tracing::info!(email = %email, tier = %tier.as_str(), "Updated profile to paid tier");
        Ok(CheckoutOutcome::Applied {
            tier,
            email: email.to_string(),
        })
    }

    async fn on_checkout_completed(
        &self,
        event: &StripeEvent,
        session: &CheckoutSession,
    ) -> ReconcileOutcome {
        let trigger = CheckoutTrigger::Webhook {
            event_id: event.id.clone(),
        };
        match self.complete_checkout(session, trigger).await {
            Ok(CheckoutOutcome::Applied { .. }) => ReconcileOutcome::Applied,
            Ok(CheckoutOutcome::AlreadyProcessed { .. }) => ReconcileOutcome::AlreadyProcessed,
            Ok(CheckoutOutcome::ProfileNotFound { .. }) | Ok(CheckoutOutcome::MissingEmail) => {
                ReconcileOutcome::ProfileNotFound
            }
            Err(_) => ReconcileOutcome::Failed,
        }
    }

    async fn on_subscription_created(
        &self,
        event: &StripeEvent,
        sub: &Subscription,
    ) -> ReconcileOutcome {
        // Redeliveries find the profile by subscription id directly; first
        // delivery resolves the customer email via the provider.
        let profile = match self.store.find_by_subscription_id(&sub.id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => match self.lookup_by_customer_email(&sub.customer).await {
                Ok(profile) => profile,
                Err(err) => {
                    tracing::error!(customer_id = %sub.customer, error = %err, "Profile lookup by customer email failed");
                    return ReconcileOutcome::Failed;
                }
            },
            Err(err) => {
                tracing::error!(subscription_id = %sub.id, error = %err, "Profile lookup failed");
                return ReconcileOutcome::Failed;
            }
        };

        let Some(profile) = profile else {
            tracing::warn!(subscription_id = %sub.id, customer_id = %sub.customer, "User not found for new subscription");
            return ReconcileOutcome::ProfileNotFound;
        };

        let tier = self.resolve_tier_or_free(sub.price_id());
        let update = ProfileUpdate {
            premium_status: Some(true),
            premium_tier: Some(tier),
            stripe_subscription_id: Some(Some(sub.id.clone())),
            stripe_customer_id: Some(Some(sub.customer.clone())),
            current_period_start: sub.current_period_start.map(|s| Some(epoch_to_datetime(s))),
            current_period_end: sub.current_period_end.map(|s| Some(epoch_to_datetime(s))),
            // A new subscription supersedes any cancellation scheduled on a
            // previous one.
            subscription_cancel_at: Some(None),
            reset_usage: false,
        };

        match self
            .apply_or_dead_letter(event, &profile.email, profile.id, &sub.id, update)
            .await
        {
            Ok(()) => {
                tracing::info!(email = %profile.email, tier = %tier.as_str(), subscription_id = %sub.id, "Subscription linked to profile");
                ReconcileOutcome::Applied
            }
            Err(_) => ReconcileOutcome::Failed,
        }
    }

    async fn on_subscription_updated(
        &self,
        event: &StripeEvent,
        sub: &Subscription,
    ) -> ReconcileOutcome {
        if !sub.cancel_at_period_end {
            // Other update reasons (plan switches, payment method changes)
            // are not modeled; renewal state arrives via invoices.
            tracing::debug!(subscription_id = %sub.id, "Subscription update without scheduled cancellation ignored");
            return ReconcileOutcome::Ignored;
        }

        let profile = match self.store.find_by_subscription_id(&sub.id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(subscription_id = %sub.id, "User not found for subscription update");
                return ReconcileOutcome::ProfileNotFound;
            }
            Err(err) => {
                tracing::error!(subscription_id = %sub.id, error = %err, "Profile lookup failed");
                return ReconcileOutcome::Failed;
            }
        };

        let Some(cancel_at) = sub.effective_cancel_at() else {
            tracing::warn!(subscription_id = %sub.id, "Scheduled cancellation without a timestamp");
            return ReconcileOutcome::Ignored;
        };

        // Record the schedule only; the user keeps access until the terminal
        // deletion event.
        let update = ProfileUpdate {
            subscription_cancel_at: Some(Some(epoch_to_datetime(cancel_at))),
            ..Default::default()
        };

        match self
            .apply_or_dead_letter(event, &profile.email, profile.id, &sub.id, update)
            .await
        {
            Ok(()) => {
                tracing::info!(subscription_id = %sub.id, email = %profile.email, "Subscription will be canceled at period end");
                ReconcileOutcome::Applied
            }
            Err(_) => ReconcileOutcome::Failed,
        }
    }

    async fn on_subscription_deleted(
        &self,
        event: &StripeEvent,
        sub: &Subscription,
    ) -> ReconcileOutcome {
        let profile = match self.store.find_by_subscription_id(&sub.id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(subscription_id = %sub.id, "User not found for deleted subscription");
                return ReconcileOutcome::ProfileNotFound;
            }
            Err(err) => {
                tracing::error!(subscription_id = %sub.id, error = %err, "Profile lookup failed");
                return ReconcileOutcome::Failed;
            }
        };

        let update = ProfileUpdate {
            premium_status: Some(false),
            premium_tier: Some(PremiumTier::Free),
            stripe_subscription_id: Some(None),
            subscription_cancel_at: Some(None),
            reset_usage: true,
            ..Default::default()
        };

        match self
            .apply_or_dead_letter(event, &profile.email, profile.id, &sub.id, update)
            .await
        {
            Ok(()) => {
                tracing::info!(email = %profile.email, "Downgraded to free tier (subscription ended)");
                ReconcileOutcome::Applied
            }
            Err(_) => ReconcileOutcome::Failed,
        }
    }

    async fn on_invoice_payment_succeeded(
        &self,
        event: &StripeEvent,
        invoice: &Invoice,
    ) -> ReconcileOutcome {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice without subscription ignored");
            return ReconcileOutcome::Ignored;
        };

        let profile = match self.store.find_by_subscription_id(subscription_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(subscription_id = %subscription_id, invoice_id = %invoice.id, "User not found for renewal invoice");
                return ReconcileOutcome::ProfileNotFound;
            }
            Err(err) => {
                tracing::error!(subscription_id = %subscription_id, error = %err, "Profile lookup failed");
                return ReconcileOutcome::Failed;
            }
        };

        // Authoritative period from the provider; the invoice's own period is
        // the fallback when that lookup fails.
        let (mut period_start, mut period_end) = self.fetch_period(subscription_id).await;
        if period_start.is_none() && period_end.is_none() {
            period_start = invoice.period_start.map(epoch_to_datetime);
            period_end = invoice.period_end.map(epoch_to_datetime);
        }

        let update = ProfileUpdate {
            current_period_start: period_start.map(Some),
            current_period_end: period_end.map(Some),
            reset_usage: true,
            ..Default::default()
        };

        match self
            .apply_or_dead_letter(event, &profile.email, profile.id, subscription_id, update)
            .await
        {
            Ok(()) => {
                tracing::info!(email = %profile.email, subscription_id = %subscription_id, "Renewal applied: usage reset, billing period refreshed");
                ReconcileOutcome::Applied
            }
            Err(_) => ReconcileOutcome::Failed,
        }
    }

    /// Resolve a price id to a tier. Unknown ids are a misconfiguration
    /// signal: they are logged loudly and counted before falling back to the
    /// free tier.
    fn resolve_tier_or_free(&self, price_id: Option<&str>) -> PremiumTier {
        let price_id = price_id.unwrap_or_default();
        match self.catalog.resolve_tier(price_id) {
            Some(tier) => tier,
            None => {
                tracing::error!(price_id = %price_id, "Price id not in plan catalog; defaulting to free tier");
                metrics::record_unknown_price_id(price_id);
                PremiumTier::Free
            }
        }
    }

    async fn lookup_by_customer_email(
        &self,
        customer_id: &str,
    ) -> Result<Option<crate::models::UserProfile>> {
        let customer = match self.stripe.get_customer(customer_id).await {
            Ok(customer) => customer,
            Err(err) => {
                tracing::warn!(customer_id = %customer_id, error = %err, "Customer lookup failed; cannot resolve email");
                return Ok(None);
            }
        };
        match customer.email {
            Some(email) => self.store.find_by_email(&email).await,
            None => Ok(None),
        }
    }

    async fn fetch_period(&self, subscription_id: &str) -> (Option<DateTime>, Option<DateTime>) {
        match self.stripe.get_subscription(subscription_id).await {
            Ok(sub) => {
                let start = sub.current_period_start.map(epoch_to_datetime);
                let end = sub.current_period_end.map(epoch_to_datetime);
                if let (Some(s), Some(e)) = (&start, &end) {
                    if e < s {
                        tracing::warn!(subscription_id = %subscription_id, "Provider returned inverted billing period; dropping period fields");
                        return (None, None);
                    }
                }
                (start, end)
            }
            Err(err) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %err,
                    "Failed to fetch subscription period; proceeding without period fields"
                );
                (None, None)
            }
        }
    }

    async fn apply_or_dead_letter(
        &self,
        event: &StripeEvent,
        email: &str,
        profile_id: Uuid,
        lookup_key: &str,
        update: ProfileUpdate,
    ) -> Result<()> {
        if let Err(err) = self.store.apply_update(profile_id, update.clone()).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                profile_id = %profile_id,
                email = %email,
                lookup_key = %lookup_key,
                error = %err,
                "Failed to persist profile update"
            );
            self.dead_letter(
                &event.id,
                &event.event_type,
                Some(profile_id),
                lookup_key,
                update,
                &err,
            )
            .await;
            return Err(err);
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        event_id: &str,
        event_type: &str,
        profile_id: Option<Uuid>,
        lookup_key: &str,
        update: ProfileUpdate,
        error: &anyhow::Error,
    ) {
        let record = DeadLetterRecord::new(
            event_id,
            event_type,
            profile_id,
            lookup_key,
            update,
            &error.to_string(),
        );
        metrics::record_dead_letter(event_type);
        if let Err(record_err) = self.store.record_dead_letter(record).await {
            tracing::error!(event_id = %event_id, error = %record_err, "Failed to record dead letter");
        }
    }
}
