//! intake-server - HTTP front for the staged registration wizards
//!
//! Hosts one wizard per browser session and forwards verification, upload
//! and registration calls to the configured backend.

pub mod backend;
pub mod config;
pub mod handlers;
pub mod session;

use axum::{
    Router,
    http::Method,
    routing::{get, post, put},
};
use intake_core::{Collaborators, IntakeError, Role, WizardDefinition};
use intake_store::{AttemptEvent, AttemptLog, AttemptOutcome, ConfigCache};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use session::SessionStore;

/// Application state
pub struct AppState {
    pub config: config::ServerConfig,
    pub sessions: Arc<SessionStore>,
    pub definitions: HashMap<Role, Arc<WizardDefinition>>,
    pub collaborators: Collaborators,
    pub config_cache: ConfigCache,
    pub attempts: Arc<Mutex<AttemptLog>>,
}

impl AppState {
    pub fn new(
        config: config::ServerConfig,
        collaborators: Collaborators,
        config_cache: ConfigCache,
        attempts: AttemptLog,
    ) -> Result<Self, IntakeError> {
        let mut definitions = HashMap::new();
        for role in Role::ALL {
            definitions.insert(role, Arc::new(role.definition()?));
        }

        let ttl = Duration::from_secs(config.sessions.ttl_secs);
        Ok(Self {
            config,
            sessions: Arc::new(SessionStore::new(ttl)),
            definitions,
            collaborators,
            config_cache,
            attempts: Arc::new(Mutex::new(attempts)),
        })
    }

    /// Write one row to the attempt log. Failures are logged and swallowed;
    /// the user flow never depends on the log.
    pub async fn record_attempt(
        &self,
        session: &str,
        role: Role,
        event: AttemptEvent,
        outcome: AttemptOutcome,
        detail: Option<&str>,
    ) {
        let log = self.attempts.lock().await;
        if let Err(e) = log.record(session, role.as_str(), event, outcome, detail) {
            tracing::warn!(session, error = %e, "Failed to record attempt");
        }
    }
}

/// Build the application router with all routes and middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers([axum::http::header::ETAG]);

    let body_limit = state.config.server.body_limit_bytes;

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/status", get(handlers::health::status))
        // POST takes a role in the first segment, GET and DELETE a session id.
        .route(
            "/wizards/{id}",
            post(handlers::wizard::create)
                .get(handlers::wizard::show)
                .delete(handlers::wizard::discard),
        )
        .route("/wizards/{id}/fields/{field}", put(handlers::wizard::set_field))
        .route("/wizards/{id}/advance", post(handlers::wizard::advance))
        .route("/wizards/{id}/retreat", post(handlers::wizard::retreat))
        .route("/wizards/{id}/jump/{step}", post(handlers::wizard::jump))
        .route("/wizards/{id}/submit", post(handlers::wizard::submit))
        .route(
            "/wizards/{id}/gates/{gate}/verify",
            post(handlers::wizard::verify_gate),
        )
        // Configuration cache
        .route(
            "/config/{key}",
            get(handlers::config::read)
                .put(handlers::config::write)
                .delete(handlers::config::remove),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
