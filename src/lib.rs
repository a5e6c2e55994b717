pub mod abuse;
pub mod audit;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod rate_limit;

use crate::abuse::AbuseControl;
use crate::config::{Environment, ShieldConfig};
use crate::error::Result;
use crate::identity::ClientIdentifier;
use crate::metrics::{metrics_handler, ProtectionMetrics, ScrapeGuard};
use crate::rate_limit::{
    shield_middleware, AdmissionStore, BucketParams, ShieldState, TokenBucketStore,
};
use axum::{middleware, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the shared state for a configuration, with the production store
pub fn build_state(config: &ShieldConfig) -> Result<ShieldState> {
    let store = TokenBucketStore::connect(config)?;
    build_state_with_store(config, Arc::new(store))
}

/// Build the shared state around any admission backend. Tests inject
/// scripted stores here.
pub fn build_state_with_store(
    config: &ShieldConfig,
    store: Arc<dyn AdmissionStore>,
) -> Result<ShieldState> {
    let params = BucketParams::from_config(config)?;

    Ok(ShieldState {
        identifier: Arc::new(ClientIdentifier::new(config.trust_proxy)),
        store,
        abuse: Arc::new(AbuseControl::new(
            config.ban_threshold,
            config.violation_window_ms,
            config.ban_duration_ms,
        )),
        metrics: Arc::new(ProtectionMetrics::new(config.latency_history_size)),
        scrape_guard: Arc::new(ScrapeGuard::new()),
        params,
    })
}

/// Compose the application router: admin endpoints outside the shield,
/// everything else behind it.
pub fn build_router(state: ShieldState) -> Router {
    let protected = Router::new()
        .route("/", get(service_banner))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            shield_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Initialize the shield server and serve until shutdown
pub async fn run(config: ShieldConfig) -> Result<()> {
    config.validate()?;

    let state = build_state(&config)?;
    let _sweeper = state.abuse.spawn_sweeper();

    // Probe the store once in the background so a dead store shows up in
    // the logs immediately; a failure is not fatal, the gateway starts in
    // fail-open.
    let probe_store = Arc::clone(&state.store);
    tokio::spawn(async move {
        match probe_store.ping().await {
            Ok(()) => audit::redis_connected(),
            Err(e) => audit::redis_error(&e),
        }
    });

    let app = build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(crate::error::ShieldError::Io)?;

    audit::server_started(&addr);
    info!(
        capacity = config.capacity,
        refill_rate = config.refill_rate,
        cost = config.cost,
        "shield ready to accept connections"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| crate::error::ShieldError::Internal(format!("server error: {}", e)))?;

    audit::redis_connection_closed();
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received");
}

async fn service_banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "atlas-shield",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Initialize tracing/logging. Production renders JSON lines for log
/// shippers; development renders compact colored output.
pub fn init_tracing(environment: Environment) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "atlas_shield=debug,tower_http=info".into());

    match environment {
        Environment::Production => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .json()
                .init();
        }
        Environment::Development => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
}
