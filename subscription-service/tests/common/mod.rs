use std::sync::Arc;

use secrecy::Secret;
use subscription_service::Application;
use subscription_service::config::{
    Config, CronConfig, DatabaseConfig, PlanConfig, ServerConfig, StripeConfig,
};
use subscription_service::models::UserProfile;
use subscription_service::services::stripe::sign_payload;
use subscription_service::services::{InMemoryProfileStore, ProfileStore};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_CRON_SECRET: &str = "cron_test_secret";

pub const STARTER_MONTHLY: &str = "price_starter_m";
pub const STARTER_YEARLY: &str = "price_starter_y";
pub const PRO_MONTHLY: &str = "price_pro_m";
pub const PRO_YEARLY: &str = "price_pro_y";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<InMemoryProfileStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    /// Spawn the service on a random port, backed by an in-memory store and
    /// with the Stripe API base pointed at `stripe_base_url` (a wiremock
    /// server in most tests).
    pub async fn spawn(stripe_base_url: &str) -> Self {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Random port
            },
            database: DatabaseConfig {
                url: Secret::new("mongodb://unused-in-tests:27017".to_string()),
                db_name: format!("subscription_test_{}", uuid::Uuid::new_v4()),
            },
            stripe: StripeConfig {
                secret_key: Secret::new("sk_test_key".to_string()),
                webhook_secret: Some(Secret::new(TEST_WEBHOOK_SECRET.to_string())),
                api_base_url: stripe_base_url.trim_end_matches('/').to_string(),
                signature_tolerance_secs: 300,
                checkout_success_url: "http://localhost:3000/success?session_id={CHECKOUT_SESSION_ID}"
                    .to_string(),
                checkout_cancel_url: "http://localhost:3000/#pricing".to_string(),
            },
            plans: PlanConfig {
                starter_monthly_price_id: STARTER_MONTHLY.to_string(),
                starter_yearly_price_id: STARTER_YEARLY.to_string(),
                pro_monthly_price_id: PRO_MONTHLY.to_string(),
                pro_yearly_price_id: PRO_YEARLY.to_string(),
            },
            cron: CronConfig {
                secret: Secret::new(TEST_CRON_SECRET.to_string()),
            },
            service_name: "subscription-service-test".to_string(),
        };

        let store = Arc::new(InMemoryProfileStore::new());
        let app = Application::build_with_store(config, Arc::clone(&store) as Arc<dyn ProfileStore>)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            client,
        }
    }

    /// Insert a fresh free-tier profile and return it.
    pub async fn seed_profile(&self, email: &str) -> UserProfile {
        let profile = UserProfile::new(email);
        self.store
            .insert_profile(profile.clone())
            .await
            .expect("Failed to seed profile");
        profile
    }

    /// POST a webhook payload with a valid signature.
    pub async fn post_webhook(&self, payload: &serde_json::Value) -> reqwest::Response {
        let body = payload.to_string();
        let now = chrono::Utc::now().timestamp();
        let signature = sign_payload(TEST_WEBHOOK_SECRET, body.as_bytes(), now)
            .expect("Failed to sign payload");
        self.client
            .post(format!("{}/api/stripe/webhook", self.address))
            .header("stripe-signature", signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to send webhook")
    }
}

/// `checkout.session.completed` payload as delivered on the webhook: line
/// items are not expanded, so the price id rides in metadata.
pub fn checkout_completed_event(
    event_id: &str,
    email: &str,
    subscription_id: &str,
    price_id: &str,
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": chrono::Utc::now().timestamp(),
        "data": {
            "object": {
                "id": format!("cs_{}", event_id),
                "customer": "cus_test",
                "customer_details": { "email": email },
                "subscription": subscription_id,
                "payment_status": "paid",
                "metadata": { "price_id": price_id }
            }
        }
    })
}

pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    subscription_id: &str,
    customer_id: &str,
    price_id: &str,
    period: (i64, i64),
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": chrono::Utc::now().timestamp(),
        "data": {
            "object": {
                "id": subscription_id,
                "customer": customer_id,
                "status": "active",
                "current_period_start": period.0,
                "current_period_end": period.1,
                "cancel_at_period_end": false,
                "items": { "data": [{ "price": { "id": price_id } }] }
            }
        }
    })
}

pub fn cancellation_scheduled_event(
    event_id: &str,
    subscription_id: &str,
    cancel_at: i64,
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "customer.subscription.updated",
        "created": chrono::Utc::now().timestamp(),
        "data": {
            "object": {
                "id": subscription_id,
                "customer": "cus_test",
                "status": "active",
                "cancel_at_period_end": true,
                "cancel_at": cancel_at
            },
            "previous_attributes": { "cancel_at_period_end": false }
        }
    })
}

pub fn invoice_paid_event(
    event_id: &str,
    subscription_id: &str,
    period: (i64, i64),
) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "invoice.payment_succeeded",
        "created": chrono::Utc::now().timestamp(),
        "data": {
            "object": {
                "id": format!("in_{}", event_id),
                "customer": "cus_test",
                "subscription": subscription_id,
                "period_start": period.0,
                "period_end": period.1
            }
        }
    })
}
