//! Upstream handshake planning.
//!
//! Browsers cannot set an `Authorization` header on a WebSocket, so the
//! provider accepts the key as a sub-protocol. A sub-protocol must be an
//! RFC 7230 token; keys that are not fall back to a query parameter.

use url::Url;

use crate::config::RelayConfig;
use crate::relay::error::RelayResult;

/// Where the API key travels in the upstream handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// `Sec-WebSocket-Protocol: <prefix><key>`.
    Subprotocol,
    /// `?<param>=<key>` on the upstream URL.
    QueryParameter,
}

/// Resolved upstream handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// URL to connect to, including any credential query parameter.
    pub url: Url,
    /// Sub-protocols to advertise, in order.
    pub protocols: Vec<String>,
    /// Where the key was placed; `None` when no key is configured.
    pub placement: Option<CredentialPlacement>,
}

/// RFC 7230 `tchar`.
const fn is_tchar(byte: u8) -> bool {
    matches!(
        byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
            | b'`' | b'|' | b'~'
    ) || byte.is_ascii_alphanumeric()
}

/// Whether `value` is a non-empty RFC 7230 token.
#[must_use]
pub fn is_token(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(is_tchar)
}

/// Build the upstream handshake from relay settings.
///
/// # Errors
/// Returns an error if the upstream URL is invalid.
pub fn plan_upstream(config: &RelayConfig) -> RelayResult<UpstreamRequest> {
    let mut url = Url::parse(&config.upstream_url)?;
    let mut protocols = vec![config.capability_protocol.clone()];

    let placement = match config.api_key.as_deref().filter(|key| !key.is_empty()) {
        Some(key) if is_token(key) => {
            protocols.push(format!("{}{key}", config.credential_protocol_prefix));
            Some(CredentialPlacement::Subprotocol)
        }
        Some(key) => {
            url.query_pairs_mut()
                .append_pair(&config.credential_query_param, key);
            Some(CredentialPlacement::QueryParameter)
        }
        None => None,
    };

    protocols.extend(config.extra_protocols.iter().cloned());

    Ok(UpstreamRequest {
        url,
        protocols,
        placement,
    })
}
