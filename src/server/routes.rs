//! HTTP route handlers for the companion relay server.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::relay::relay_socket;

use super::state::AppState;

/// Path of the realtime relay endpoint.
pub const REALTIME_PATH: &str = "/realtime";

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(REALTIME_PATH, get(realtime))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "companion-link",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Answer to a plain GET on the relay endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayDescriptor {
    /// Always `"ready"`.
    pub status: &'static str,
    /// Relay endpoint path.
    pub endpoint: &'static str,
    /// Sub-protocol clients must offer.
    pub protocol: String,
    /// Whether a provider key is configured.
    pub upstream_configured: bool,
}

/// Upgrade to a relay session, or describe the relay for plain requests.
async fn realtime(
    State(state): State<Arc<AppState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        return Json(RelayDescriptor {
            status: "ready",
            endpoint: REALTIME_PATH,
            protocol: state.relay.capability_protocol.clone(),
            upstream_configured: state.relay.api_key.is_some(),
        })
        .into_response();
    };

    let session = Uuid::new_v4();
    upgrade
        .protocols([state.relay.capability_protocol.clone()])
        .on_upgrade(move |socket| {
            async move {
                info!("relay session started");
                let end = relay_socket(socket, &state.relay).await;
                info!("relay session ended: {end:?}");
            }
            .instrument(info_span!("relay", session = %session))
        })
}
