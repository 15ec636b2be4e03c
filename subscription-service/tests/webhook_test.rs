mod common;

use common::*;
use subscription_service::models::PremiumTier;
use subscription_service::services::ProfileStore;
use subscription_service::services::stripe::sign_payload;
use wiremock::MockServer;

#[tokio::test]
async fn valid_signed_event_is_acknowledged() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;
    app.seed_profile("buyer@example.com").await;

    let event = subscription_event(
        "evt_ack",
        "customer.subscription.updated",
        "sub_unknown",
        "cus_1",
        PRO_MONTHLY,
        (1_700_000_000, 1_702_592_000),
    );
    let response = app.post_webhook(&event).await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["received"], true);
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;
    let profile = app.seed_profile("victim@example.com").await;

    let event = checkout_completed_event("evt_forged", "victim@example.com", "sub_f", PRO_MONTHLY);
    let body = event.to_string();
    let now = chrono::Utc::now().timestamp();
    let signature = sign_payload(TEST_WEBHOOK_SECRET, body.as_bytes(), now).unwrap();

    // Body altered after signing.
    let tampered = body.replace(PRO_MONTHLY, "price_injected");
    let response = app
        .client
        .post(format!("{}/api/stripe/webhook", app.address))
        .header("stripe-signature", signature)
        .header("content-type", "application/json")
        .body(tampered)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let untouched = app.store.find_by_id(profile.id).await.unwrap().unwrap();
    assert!(!untouched.premium_status);
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let event = checkout_completed_event("evt_nosig", "a@example.com", "sub_1", PRO_MONTHLY);
    let response = app
        .client
        .post(format!("{}/api/stripe/webhook", app.address))
        .header("content-type", "application/json")
        .body(event.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn empty_body_is_rejected() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let response = app
        .client
        .post(format!("{}/api/stripe/webhook", app.address))
        .header("stripe-signature", "t=1,v1=aa")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn stale_signature_timestamp_is_rejected() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let event = checkout_completed_event("evt_stale", "a@example.com", "sub_1", PRO_MONTHLY);
    let body = event.to_string();
    let stale = chrono::Utc::now().timestamp() - 3600;
    let signature = sign_payload(TEST_WEBHOOK_SECRET, body.as_bytes(), stale).unwrap();

    let response = app
        .client
        .post(format!("{}/api/stripe/webhook", app.address))
        .header("stripe-signature", signature)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn event_for_unknown_profile_is_acknowledged() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    // No profile seeded; retrying cannot fix this, so the event is acked.
    let event = checkout_completed_event("evt_noone", "ghost@example.com", "sub_g", PRO_MONTHLY);
    let response = app.post_webhook(&event).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn unknown_event_type_is_acknowledged_without_action() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;
    let profile = app.seed_profile("bystander@example.com").await;

    let event = serde_json::json!({
        "id": "evt_other",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_1" } }
    });
    let response = app.post_webhook(&event).await;

    assert_eq!(response.status(), 200);
    let untouched = app.store.find_by_id(profile.id).await.unwrap().unwrap();
    assert_eq!(untouched.premium_tier, PremiumTier::Free);
}

#[tokio::test]
async fn webhook_counters_show_up_in_metrics_output() {
    let stripe = MockServer::start().await;
    let app = TestApp::spawn(&stripe.uri()).await;

    let event = serde_json::json!({
        "id": "evt_counted",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_1" } }
    });
    assert_eq!(app.post_webhook(&event).await.status(), 200);

    let metrics = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    // The recorder and the counter macros must share one metrics registry,
    // otherwise increments vanish and this renders empty.
    assert!(
        metrics.contains("subscription_webhook_events_total"),
        "webhook counter missing from /metrics output: {:?}",
        metrics
    );
}
