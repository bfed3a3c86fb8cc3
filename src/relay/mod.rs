//! Full-duplex relay between a browser WebSocket and a realtime provider.
//!
//! - `frame`: transport-neutral frames and proxy notifications
//! - `credentials`: upstream URL and sub-protocol planning
//! - `upstream`: socket adapters for both sides
//! - `session`: the per-connection state machine

pub mod credentials;
pub mod error;
pub mod frame;
pub mod session;
pub mod upstream;

pub use credentials::{CredentialPlacement, UpstreamRequest, is_token, plan_upstream};
pub use error::{RelayError, RelayResult};
pub use frame::{CloseInfo, ProxyEvent, RelayFrame};
pub use session::{SessionEnd, run_session};

use axum::extract::ws::WebSocket;

use crate::config::RelayConfig;

/// Relay an upgraded browser socket to the configured provider.
pub async fn relay_socket(socket: WebSocket, config: &RelayConfig) -> SessionEnd {
    let (down_tx, down_rx) = upstream::split_downstream(socket);
    let plan = plan_upstream(config);
    let connect = async move { upstream::connect_upstream(plan?).await };
    run_session(down_tx, down_rx, connect).await
}
