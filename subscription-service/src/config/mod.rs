use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub plans: PlanConfig,
    pub cron: CronConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    /// Webhook signing secret. When absent, webhook signature verification is
    /// bypassed; never deploy to production without it.
    pub webhook_secret: Option<Secret<String>>,
    pub api_base_url: String,
    /// Accepted clock skew for the webhook signature timestamp, in seconds.
    pub signature_tolerance_secs: i64,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

/// Provider price identifiers for each paid plan and billing interval.
#[derive(Deserialize, Clone, Debug)]
pub struct PlanConfig {
    pub starter_monthly_price_id: String,
    pub starter_yearly_price_id: String,
    pub pro_monthly_price_id: String,
    pub pro_yearly_price_id: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CronConfig {
    pub secret: Secret<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("SUBSCRIPTION_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SUBSCRIPTION_SERVICE_PORT")
            .unwrap_or_else(|_| "3004".to_string())
            .parse()?;

        let db_url =
            env::var("SUBSCRIPTION_DATABASE_URL").expect("SUBSCRIPTION_DATABASE_URL must be set");
        let db_name = env::var("SUBSCRIPTION_DATABASE_NAME")
            .unwrap_or_else(|_| "subscription_db".to_string());

        let stripe_secret_key =
            env::var("STRIPE_SECRET_KEY").expect("STRIPE_SECRET_KEY must be set");
        let stripe_webhook_secret = env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(Secret::new);
        let stripe_api_base_url = env::var("STRIPE_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string());
        let signature_tolerance_secs = env::var("STRIPE_SIGNATURE_TOLERANCE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let site_url = env::var("SITE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let checkout_success_url = env::var("CHECKOUT_SUCCESS_URL").unwrap_or_else(|_| {
            format!("{}/success?session_id={{CHECKOUT_SESSION_ID}}", site_url)
        });
        let checkout_cancel_url =
            env::var("CHECKOUT_CANCEL_URL").unwrap_or_else(|_| format!("{}/#pricing", site_url));

        let plans = PlanConfig {
            starter_monthly_price_id: env::var("STRIPE_STARTER_PRICE_ID").unwrap_or_default(),
            starter_yearly_price_id: env::var("STRIPE_STARTER_YEARLY_PRICE_ID").unwrap_or_default(),
            pro_monthly_price_id: env::var("STRIPE_PRO_PRICE_ID").unwrap_or_default(),
            pro_yearly_price_id: env::var("STRIPE_PRO_YEARLY_PRICE_ID").unwrap_or_default(),
        };

        let cron_secret = env::var("CRON_SECRET").expect("CRON_SECRET must be set");

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            stripe: StripeConfig {
                secret_key: Secret::new(stripe_secret_key),
                webhook_secret: stripe_webhook_secret,
                api_base_url: stripe_api_base_url,
                signature_tolerance_secs,
                checkout_success_url,
                checkout_cancel_url,
            },
            plans,
            cron: CronConfig {
                secret: Secret::new(cron_secret),
            },
            service_name: "subscription-service".to_string(),
        })
    }
}
