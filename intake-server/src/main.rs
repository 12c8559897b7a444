//! intake-server entry point

use intake_store::{AttemptLog, ConfigCache};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intake_server::{
    AppState, backend::http_collaborators, build_router, config::ServerConfig, session,
};

#[tokio::main]
async fn main() {
    // Load configuration before logging so the level and format apply
    let config_path = std::env::var("INTAKE_CONFIG").ok().or_else(|| {
        std::path::Path::new("config.yaml")
            .exists()
            .then(|| "config.yaml".to_string())
    });
    let (config, config_error) = match ServerConfig::load(config_path.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (ServerConfig::default(), Some(e.to_string())),
    };

    init_tracing(&config);

    if let Some(e) = config_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }
    tracing::info!("Starting intake-server...");

    if let Err(e) = std::fs::create_dir_all(&config.storage.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    let config_cache = ConfigCache::open(config.config_cache_db_path()).unwrap_or_else(|e| {
        tracing::error!("Failed to open config cache: {}", e);
        std::process::exit(1);
    });

    let attempts = AttemptLog::open(config.audit_db_path()).unwrap_or_else(|e| {
        tracing::error!("Failed to open attempt log: {}", e);
        std::process::exit(1);
    });

    let collaborators = http_collaborators(&config.backend).unwrap_or_else(|e| {
        tracing::error!("Failed to build backend client: {}", e);
        std::process::exit(1);
    });

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let sweep_interval = Duration::from_secs(config.sessions.sweep_interval_secs.max(1));
    tracing::info!(backend = %config.backend.base_url, "Registration backend");

    let state = AppState::new(config, collaborators, config_cache, attempts).unwrap_or_else(|e| {
        tracing::error!("Failed to build wizard definitions: {}", e);
        std::process::exit(1);
    });
    let state = Arc::new(state);

    let sweeper = session::spawn_sweeper(state.sessions.clone(), sweep_interval);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Server error: {}", e);
        });

    sweeper.abort();
    tracing::info!("Server shut down gracefully");
}

fn init_tracing(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
