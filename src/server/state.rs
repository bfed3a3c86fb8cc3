//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::config::RelayConfig;

/// Shared application state.
pub struct AppState {
    /// Realtime relay settings.
    pub relay: RelayConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(relay: RelayConfig) -> Arc<Self> {
        Arc::new(Self { relay })
    }
}
