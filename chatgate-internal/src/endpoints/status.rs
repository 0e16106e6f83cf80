use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppState;

pub const CHATGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Service identity plus a few live figures from each component
pub async fn status_handler(State(app_state): AppState) -> Json<Value> {
    let rate_limit = match &app_state.rate_limiter {
        Some(limiter) => json!({
            "enabled": true,
            "tracked_clients": limiter.tracked_clients(),
        }),
        None => json!({ "enabled": false }),
    };
    Json(json!({
        "status": "ok",
        "name": "chatgate",
        "version": CHATGATE_VERSION,
        "usage_store": app_state.usage_counter.store_name(),
        "cache_entries": app_state.cache.size(),
        "rate_limit": rate_limit,
    }))
}
