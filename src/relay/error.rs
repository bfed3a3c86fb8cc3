//! Error types for the realtime relay.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Browser-side socket failed.
    #[error("downstream socket error: {0}")]
    Downstream(#[from] axum::Error),
    /// Provider-side socket failed.
    #[error("upstream socket error: {0}")]
    Upstream(#[from] tungstenite::Error),
    /// Upstream URL is invalid.
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
    /// Sub-protocol list cannot be sent as a header.
    #[error("invalid sub-protocol header: {0}")]
    Header(#[from] tungstenite::http::header::InvalidHeaderValue),
    /// Proxy notification could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The other side went away.
    #[error("peer closed")]
    Closed,
}

/// Convenience result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
