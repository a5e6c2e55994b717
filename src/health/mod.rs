use crate::rate_limit::middleware::ShieldState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

/// Health endpoint handler.
///
/// A degraded store does not flip overall status: the gateway keeps
/// serving through fail-open, so `status` stays "ok" while the `redis`
/// service entry reports the degradation.
pub async fn health_handler(State(state): State<ShieldState>) -> impl IntoResponse {
    let redis_status = match state.store.ping().await {
        Ok(()) => "healthy",
        Err(_) => "degraded",
    };

    Json(json!({
        "status": "ok",
        "services": {
            "api": "healthy",
            "redis": redis_status,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
