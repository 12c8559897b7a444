use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use intake_store::{CachedConfig, StoreError};
use serde_json::Value;
use std::sync::Arc;

use super::{ApiError, api_error, not_found};
use crate::AppState;

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::InvalidKey(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        _ => {
            tracing::error!(error = %e, "Config cache error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Config cache unavailable")
        }
    }
}

fn with_etag(status: StatusCode, entry: CachedConfig) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(val) = entry.etag().parse() {
        headers.insert(header::ETAG, val);
    }
    (status, headers, Json(entry.payload)).into_response()
}

/// Read a config document (GET /config/{key})
pub async fn read(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let candidates = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(str::trim).collect::<Vec<_>>())
        .unwrap_or_default();

    for tag in candidates {
        if state.config_cache.is_current(&key, tag).map_err(store_error)? {
            let mut headers = HeaderMap::new();
            if let Ok(val) = tag.parse() {
                headers.insert(header::ETAG, val);
            }
            return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
        }
    }

    let entry = state
        .config_cache
        .get(&key)
        .map_err(store_error)?
        .ok_or_else(|| not_found("Config", &key))?;
    Ok(with_etag(StatusCode::OK, entry))
}

/// Replace a config document (PUT /config/{key})
pub async fn write(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let entry = state
        .config_cache
        .set(&key, payload)
        .map_err(store_error)?;
    tracing::info!(key = %key, version = entry.version, "Updated config document");
    Ok(with_etag(StatusCode::OK, entry))
}

/// Delete a config document (DELETE /config/{key})
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.config_cache.delete(&key).map_err(store_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Config", &key))
    }
}
