use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

/// Health check (GET /health)
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
        "sessions": state.sessions.len().await,
    }))
}

/// Operational status (GET /status): live sessions, cached config
/// documents and the latest registration attempts.
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config_keys = state.config_cache.keys().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to list config keys");
        Vec::new()
    });

    let attempts = state.attempts.lock().await;
    let recent = attempts.recent(20).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to read attempt log");
        Vec::new()
    });
    drop(attempts);

    Json(json!({
        "serverName": "intake",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
        "configKeys": config_keys,
        "recentAttempts": recent,
    }))
}
