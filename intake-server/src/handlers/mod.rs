pub mod config;
pub mod health;
pub mod wizard;

use axum::{http::StatusCode, response::Json};
use serde_json::{Value, json};

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": message.into(),
        })),
    )
}

pub fn not_found(what: &str, id: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("{} not found: {}", what, id))
}
