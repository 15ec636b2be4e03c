use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's subscription level. Paid tiers carry a provider subscription;
/// `Free` never does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PremiumTier {
    #[default]
    Free,
    Starter,
    Pro,
}

impl PremiumTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PremiumTier::Free => "free",
            PremiumTier::Starter => "starter",
            PremiumTier::Pro => "pro",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PremiumTier::Free)
    }
}

/// Monthly usage counters. Resets zero every key in one write, so the
/// counters can never be partially reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub asset_extractions: i64,
    pub contrast_checks: i64,
    pub lottie_extractions: i64,
    pub ai_generations: i64,
}

impl UsageCounters {
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.asset_extractions == 0
            && self.contrast_checks == 0
            && self.lottie_extractions == 0
            && self.ai_generations == 0
    }
}

/// Identity plus billing state for one user. Created once at signup; mutated
/// only by the reconciliation engine and the fallback verifier.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub email: String,
    pub premium_status: bool,
    pub premium_tier: PremiumTier,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub current_period_start: Option<DateTime>,
    pub current_period_end: Option<DateTime>,
    /// Set while a cancellation is scheduled but not yet effective.
    pub subscription_cancel_at: Option<DateTime>,
    pub usage: UsageCounters,
    pub discount_percentage: i32,
    pub has_waitlist_discount: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl UserProfile {
    /// A fresh free-tier profile. Emails are stored lowercased so lookups by
    /// provider-supplied addresses are case-insensitive.
    pub fn new(email: &str) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            premium_status: false,
            premium_tier: PremiumTier::Free,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            current_period_start: None,
            current_period_end: None,
            subscription_cancel_at: None,
            usage: UsageCounters::zeroed(),
            discount_percentage: 0,
            has_waitlist_discount: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Waitlist members get a one-time signup discount; immutable afterward.
    pub fn with_waitlist_discount(mut self, percentage: i32) -> Self {
        self.has_waitlist_discount = true;
        self.discount_percentage = percentage;
        self
    }
}

/// Durable record of a profile mutation that could not be persisted on the
/// webhook path. The webhook still acknowledges the event, so without this
/// record the failed update would be unrecoverable once the provider stops
/// retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub profile_id: Option<Uuid>,
    pub lookup_key: String,
    pub update: crate::services::store::ProfileUpdate,
    pub error: String,
    pub created_at: DateTime,
}

impl DeadLetterRecord {
    pub fn new(
        event_id: &str,
        event_type: &str,
        profile_id: Option<Uuid>,
        lookup_key: &str,
        update: crate::services::store::ProfileUpdate,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            profile_id,
            lookup_key: lookup_key.to_string(),
            update,
            error: error.to_string(),
            created_at: DateTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_is_free_with_zero_usage() {
        let profile = UserProfile::new("User@Example.COM ");
        assert_eq!(profile.email, "user@example.com");
        assert!(!profile.premium_status);
        assert_eq!(profile.premium_tier, PremiumTier::Free);
        assert!(profile.stripe_subscription_id.is_none());
        assert!(profile.usage.is_zero());
    }

    #[test]
    fn waitlist_discount_is_set_once() {
        let profile = UserProfile::new("a@b.c").with_waitlist_discount(20);
        assert!(profile.has_waitlist_discount);
        assert_eq!(profile.discount_percentage, 20);
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PremiumTier::Starter).unwrap(),
            "\"starter\""
        );
        assert_eq!(
            serde_json::from_str::<PremiumTier>("\"pro\"").unwrap(),
            PremiumTier::Pro
        );
    }
}
