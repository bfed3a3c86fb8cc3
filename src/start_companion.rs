//! Startup helpers for the companion binaries.

use std::process::ExitCode;
use std::sync::Arc;

use crate::config::CompanionConfig;
use crate::server::{self, AppState};

/// Install the `fmt` subscriber with an `info` default directive.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

/// Load and validate configuration from the environment.
///
/// # Errors
/// Returns an error if a variable is malformed or the result is invalid.
pub fn load_config() -> Result<CompanionConfig, Box<dyn std::error::Error + Send + Sync>> {
    Ok(CompanionConfig::from_env()?)
}

/// Run the relay server (used by the `companion-server` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    init_tracing();

    tracing::info!("Starting companion relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    tracing::info!("Realtime upstream: {}", config.relay.upstream_url);
    if config.relay.api_key.is_none() {
        tracing::warn!("COMPANION_REALTIME_API_KEY is not set; upstream may reject sessions");
    }

    let state = initialize(&config);
    let port = config.server.port;

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(server::run_server_with_shutdown(state, port, shutdown_signal())) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    tracing::info!("Server stopped");
    ExitCode::SUCCESS
}

/// Build application state without starting the server.
#[must_use]
pub fn initialize(config: &CompanionConfig) -> Arc<AppState> {
    AppState::new(config.relay.clone())
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl+C handler failed: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}
