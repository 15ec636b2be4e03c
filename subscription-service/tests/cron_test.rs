mod common;

use chrono::TimeZone;
use common::*;
use subscription_service::handlers::cron::run_usage_reset;
use subscription_service::models::{PremiumTier, UsageCounters, UserProfile};
use subscription_service::services::{InMemoryProfileStore, ProfileStore};
use wiremock::MockServer;

async fn store_with_usage() -> (InMemoryProfileStore, UserProfile, UserProfile) {
    let store = InMemoryProfileStore::new();

    let free = UserProfile::new("free@example.com");
    store.insert_profile(free.clone()).await.unwrap();

    let mut paid = UserProfile::new("paid@example.com");
    paid.premium_status = true;
    paid.premium_tier = PremiumTier::Pro;
    paid.stripe_subscription_id = Some("sub_paid".to_string());
    store.insert_profile(paid.clone()).await.unwrap();

    // Both accounts have consumed quota.
    let consumed = UsageCounters {
        asset_extractions: 9,
        contrast_checks: 2,
        lottie_extractions: 0,
        ai_generations: 0,
    };
    store.set_usage(free.id, consumed.clone());
    store.set_usage(paid.id, consumed);

    (store, free, paid)
}

#[tokio::test]
async fn first_of_month_resets_free_accounts_only() {
    let (store, free, paid) = store_with_usage().await;
    let first = chrono::Utc.with_ymd_and_hms(2026, 9, 1, 6, 0, 0).unwrap();

    let results = run_usage_reset(&store, first).await.unwrap();
    assert_eq!(results.free_users_reset, 1);
    assert!(results.errors.is_empty());

    let free_after = store.find_by_id(free.id).await.unwrap().unwrap();
    assert!(free_after.usage.is_zero());

    // Paid accounts reset on their own billing anniversary, not the calendar.
    let paid_after = store.find_by_id(paid.id).await.unwrap().unwrap();
    assert!(!paid_after.usage.is_zero());
}

#[tokio::test]
async fn other_days_are_a_noop() {
    let (store, free, _) = store_with_usage().await;
    let mid_month = chrono::Utc.with_ymd_and_hms(2026, 9, 15, 6, 0, 0).unwrap();

    let results = run_usage_reset(&store, mid_month).await.unwrap();
    assert_eq!(results.free_users_reset, 0);

    let free_after = store.find_by_id(free.id).await.unwrap().unwrap();
    assert!(!free_after.usage.is_zero());
}

#[tokio::test]
async fn endpoint_requires_the_shared_secret() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let no_secret = app
        .client
        .post(format!("{}/api/cron/reset-usage", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(no_secret.status(), 401);

    let wrong_secret = app
        .client
        .post(format!("{}/api/cron/reset-usage", app.address))
        .header("x-cron-secret", "guess")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_secret.status(), 401);
}

#[tokio::test]
async fn endpoint_accepts_secret_via_header_or_body() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let via_header = app
        .client
        .post(format!("{}/api/cron/reset-usage", app.address))
        .header("x-cron-secret", TEST_CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(via_header.status(), 200);
    let body: serde_json::Value = via_header.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["results"]["freeUsersReset"].is_number());

    let via_body = app
        .client
        .post(format!("{}/api/cron/reset-usage", app.address))
        .json(&serde_json::json!({ "secret": TEST_CRON_SECRET }))
        .send()
        .await
        .unwrap();
    assert_eq!(via_body.status(), 200);
}
