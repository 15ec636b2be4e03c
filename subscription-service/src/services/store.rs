//! Profile store: the one mutation seam shared by the webhook and fallback
//! paths.
//!
//! Every reconciliation outcome is expressed as a [`ProfileUpdate`] applied
//! to a single profile document, so each transition is one conditional write
//! keyed by primary id.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, DateTime, doc};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DeadLetterRecord, PremiumTier, UserProfile};

/// One profile mutation. `None` leaves a field untouched; `Some(None)` clears
/// a nullable field. `reset_usage` zeroes every counter in the same write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_tier: Option<PremiumTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<Option<DateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<Option<DateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_cancel_at: Option<Option<DateTime>>,
    #[serde(default)]
    pub reset_usage: bool,
}

impl ProfileUpdate {
    pub fn reset_usage_only() -> Self {
        Self {
            reset_usage: true,
            ..Self::default()
        }
    }

    /// Rejects updates that would violate the billing-window invariant.
    pub fn validate(&self) -> Result<()> {
        if let (Some(Some(start)), Some(Some(end))) =
            (&self.current_period_start, &self.current_period_end)
        {
            if end < start {
                bail!(
                    "current_period_end {} precedes current_period_start {}",
                    end,
                    start
                );
            }
        }
        Ok(())
    }
}

/// Read/update access to user profiles, keyed by id, email, or provider
/// subscription id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>>;
    async fn find_by_subscription_id(&self, subscription_id: &str)
    -> Result<Option<UserProfile>>;
    async fn insert_profile(&self, profile: UserProfile) -> Result<()>;
    async fn apply_update(&self, id: Uuid, update: ProfileUpdate) -> Result<()>;
    async fn list_free_profiles(&self) -> Result<Vec<UserProfile>>;
    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<()>;
}

/// MongoDB-backed store used in production.
#[derive(Clone)]
pub struct MongoProfileStore {
    profiles: Collection<UserProfile>,
    dead_letters: Collection<DeadLetterRecord>,
}

impl MongoProfileStore {
    pub fn new(db: &Database) -> Self {
        Self {
            profiles: db.collection("user_profiles"),
            dead_letters: db.collection("dead_letters"),
        }
    }

    /// Unique email, and unique-sparse subscription id: the index is what
    /// enforces "at most one profile per provider subscription" at update
    /// time.
    pub async fn init_indexes(&self) -> Result<()> {
        let email_index = IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(
                IndexOptions::builder()
                    .name("unique_email_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let subscription_index = IndexModel::builder()
            .keys(doc! { "stripe_subscription_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("unique_subscription_idx".to_string())
                    .unique(true)
                    .sparse(true)
                    .build(),
            )
            .build();

        self.profiles
            .create_indexes([email_index, subscription_index], None)
            .await?;

        tracing::info!("Subscription service indexes initialized");
        Ok(())
    }
}

fn update_document(update: &ProfileUpdate) -> mongodb::bson::Document {
    let mut set = doc! { "updated_at": DateTime::now() };

    if let Some(status) = update.premium_status {
        set.insert("premium_status", status);
    }
    if let Some(tier) = update.premium_tier {
        set.insert("premium_tier", tier.as_str());
    }
    match &update.stripe_subscription_id {
        Some(Some(id)) => {
            set.insert("stripe_subscription_id", id.clone());
        }
        Some(None) => {
            set.insert("stripe_subscription_id", Bson::Null);
        }
        None => {}
    }
    match &update.stripe_customer_id {
        Some(Some(id)) => {
            set.insert("stripe_customer_id", id.clone());
        }
        Some(None) => {
            set.insert("stripe_customer_id", Bson::Null);
        }
        None => {}
    }
    match update.current_period_start {
        Some(Some(ts)) => {
            set.insert("current_period_start", ts);
        }
        Some(None) => {
            set.insert("current_period_start", Bson::Null);
        }
        None => {}
    }
    match update.current_period_end {
        Some(Some(ts)) => {
            set.insert("current_period_end", ts);
        }
        Some(None) => {
            set.insert("current_period_end", Bson::Null);
        }
        None => {}
    }
    match update.subscription_cancel_at {
        Some(Some(ts)) => {
            set.insert("subscription_cancel_at", ts);
        }
        Some(None) => {
            set.insert("subscription_cancel_at", Bson::Null);
        }
        None => {}
    }
    if update.reset_usage {
        set.insert("usage.asset_extractions", 0i64);
        set.insert("usage.contrast_checks", 0i64);
        set.insert("usage.lottie_extractions", 0i64);
        set.insert("usage.ai_generations", 0i64);
    }

    doc! { "$set": set }
}

#[async_trait]
impl ProfileStore for MongoProfileStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let profile = self
            .profiles
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?;
        Ok(profile)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let profile = self
            .profiles
            .find_one(doc! { "email": email.trim().to_lowercase() }, None)
            .await?;
        Ok(profile)
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserProfile>> {
        let profile = self
            .profiles
            .find_one(doc! { "stripe_subscription_id": subscription_id }, None)
            .await?;
        Ok(profile)
    }

    async fn insert_profile(&self, profile: UserProfile) -> Result<()> {
        self.profiles.insert_one(profile, None).await?;
        Ok(())
    }

    async fn apply_update(&self, id: Uuid, update: ProfileUpdate) -> Result<()> {
        update.validate()?;
        let result = self
            .profiles
            .update_one(doc! { "_id": id.to_string() }, update_document(&update), None)
            .await?;
        if result.matched_count == 0 {
            bail!("profile {} not found for update", id);
        }
        Ok(())
    }

    async fn list_free_profiles(&self) -> Result<Vec<UserProfile>> {
        let cursor = self
            .profiles
            .find(doc! { "premium_tier": "free" }, None)
            .await?;
        let profiles: Vec<UserProfile> = cursor.try_collect().await?;
        Ok(profiles)
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        self.dead_letters.insert_one(record, None).await?;
        Ok(())
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: Mutex<HashMap<Uuid, UserProfile>>,
    dead_letters: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.lock().unwrap().clone()
    }

    /// Directly set usage counters. The service itself only ever resets
    /// counters; consumption is recorded by other backends, so tests seed it
    /// here.
    pub fn set_usage(&self, id: Uuid, usage: crate::models::UsageCounters) {
        if let Some(profile) = self.profiles.lock().unwrap().get_mut(&id) {
            profile.usage = usage;
        }
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.profiles.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let needle = email.trim().to_lowercase();
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .values()
            .find(|p| p.email == needle)
            .cloned())
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserProfile>> {
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .values()
            .find(|p| p.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn insert_profile(&self, profile: UserProfile) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap();
        if profiles.values().any(|p| p.email == profile.email) {
            bail!("duplicate email {}", profile.email);
        }
        profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn apply_update(&self, id: Uuid, update: ProfileUpdate) -> Result<()> {
        update.validate()?;

        let mut profiles = self.profiles.lock().unwrap();

        // Uniqueness check before taking the mutable borrow.
        if let Some(Some(new_sub_id)) = &update.stripe_subscription_id {
            let taken = profiles
                .values()
                .any(|p| p.id != id && p.stripe_subscription_id.as_deref() == Some(new_sub_id));
            if taken {
                bail!("subscription id {} already mapped to another profile", new_sub_id);
            }
        }

        let profile = profiles
            .get_mut(&id)
            .ok_or_else(|| anyhow!("profile {} not found for update", id))?;

        if let Some(status) = update.premium_status {
            profile.premium_status = status;
        }
        if let Some(tier) = update.premium_tier {
            profile.premium_tier = tier;
        }
        if let Some(sub_id) = update.stripe_subscription_id {
            profile.stripe_subscription_id = sub_id;
        }
        if let Some(customer_id) = update.stripe_customer_id {
            profile.stripe_customer_id = customer_id;
        }
        if let Some(start) = update.current_period_start {
            profile.current_period_start = start;
        }
        if let Some(end) = update.current_period_end {
            profile.current_period_end = end;
        }
        if let Some(cancel_at) = update.subscription_cancel_at {
            profile.subscription_cancel_at = cancel_at;
        }
        if update.reset_usage {
            profile.usage = crate::models::UsageCounters::zeroed();
        }
        profile.updated_at = DateTime::now();

        Ok(())
    }

    async fn list_free_profiles(&self) -> Result<Vec<UserProfile>> {
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.premium_tier == PremiumTier::Free)
            .cloned()
            .collect())
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        self.dead_letters.lock().unwrap().push(record);
        Ok(())
    }
}
