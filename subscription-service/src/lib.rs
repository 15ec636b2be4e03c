pub mod config;
pub mod handlers;
pub mod models;
pub mod services;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Request;
use axum::routing::{get, post};
use secrecy::ExposeSecret;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use service_core::middleware::{REQUEST_ID_HEADER, request_id_middleware};

use crate::config::Config;
use crate::services::{
    MongoProfileStore, PlanCatalog, ProfileStore, Reconciler, StripeClient, metrics,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ProfileStore>,
    pub stripe: StripeClient,
    pub catalog: PlanCatalog,
    pub reconciler: Reconciler,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/api/stripe/webhook", post(handlers::stripe::webhook))
        .route(
            "/api/stripe/verify-session",
            post(handlers::stripe::verify_session),
        )
        .route(
            "/api/stripe/create-checkout-session",
            post(handlers::stripe::create_checkout_session),
        )
        .route(
            "/api/stripe/cancel-subscription",
            post(handlers::stripe::cancel_subscription),
        )
        .route("/api/cron/reset-usage", post(handlers::cron::reset_usage))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .with_state(state)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Production entry point: connects to MongoDB and ensures indexes
    /// before accepting traffic.
    pub async fn build(config: Config) -> Result<Self> {
        let options =
            mongodb::options::ClientOptions::parse(config.database.url.expose_secret()).await?;
        let client = mongodb::Client::with_options(options)?;
        let db = client.database(&config.database.db_name);

        let store = MongoProfileStore::new(&db);
        store.init_indexes().await?;

        Self::build_with_store(config, Arc::new(store)).await
    }

    /// Wire the application around any store implementation. Test harnesses
    /// pass an in-memory store here.
    pub async fn build_with_store(config: Config, store: Arc<dyn ProfileStore>) -> Result<Self> {
        metrics::init_metrics();

        let address = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&address).await?;
        let port = listener.local_addr()?.port();

        let catalog = PlanCatalog::new(config.plans.clone());
        let stripe = StripeClient::new(config.stripe.clone());
        let reconciler = Reconciler::new(catalog.clone(), Arc::clone(&store), stripe.clone());

        let state = AppState {
            config: Arc::new(config),
            store,
            stripe,
            catalog,
            reconciler,
        };

        Ok(Self {
            port,
            listener,
            router: router(state),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(port = self.port, "Subscription service listening");
        axum::serve(self.listener, self.router).await
    }
}
