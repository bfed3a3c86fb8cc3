//! Transport-neutral frames and relay notifications.

use axum::extract::ws::{self, CloseFrame as AxumCloseFrame};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame as WsCloseFrame};

use crate::relay::error::RelayResult;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame, or never opened.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close status and reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// Status code.
    pub code: u16,
    /// Reason text.
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure with no reason.
    #[must_use]
    pub const fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }
}

/// A frame crossing the relay. Control frames other than close stay on
/// their own connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayFrame {
    /// UTF-8 payload.
    Text(String),
    /// Opaque payload.
    Binary(Bytes),
    /// Close request.
    Close(Option<CloseInfo>),
}

impl RelayFrame {
    /// Convert a browser-side message; ping and pong yield `None`.
    #[must_use]
    pub fn from_downstream(message: ws::Message) -> Option<Self> {
        match message {
            ws::Message::Text(text) => Some(Self::Text(text.as_str().to_string())),
            ws::Message::Binary(data) => Some(Self::Binary(data)),
            ws::Message::Close(frame) => Some(Self::Close(frame.map(|frame| CloseInfo {
                code: frame.code,
                reason: frame.reason.as_str().to_string(),
            }))),
            ws::Message::Ping(_) | ws::Message::Pong(_) => None,
        }
    }

    /// Convert into a browser-side message.
    #[must_use]
    pub fn into_downstream(self) -> ws::Message {
        match self {
            Self::Text(text) => ws::Message::Text(text.into()),
            Self::Binary(data) => ws::Message::Binary(data),
            Self::Close(info) => ws::Message::Close(info.map(|info| AxumCloseFrame {
                code: info.code,
                reason: info.reason.into(),
            })),
        }
    }

    /// Convert a provider-side message; ping, pong and raw frames yield `None`.
    #[must_use]
    pub fn from_upstream(message: tungstenite::Message) -> Option<Self> {
        match message {
            tungstenite::Message::Text(text) => Some(Self::Text(text.as_str().to_string())),
            tungstenite::Message::Binary(data) => Some(Self::Binary(data)),
            tungstenite::Message::Close(frame) => Some(Self::Close(frame.map(|frame| CloseInfo {
                code: frame.code.into(),
                reason: frame.reason.as_str().to_string(),
            }))),
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => None,
        }
    }

    /// Convert into a provider-side message.
    #[must_use]
    pub fn into_upstream(self) -> tungstenite::Message {
        match self {
            Self::Text(text) => tungstenite::Message::Text(text.into()),
            Self::Binary(data) => tungstenite::Message::Binary(data),
            Self::Close(info) => tungstenite::Message::Close(info.map(|info| WsCloseFrame {
                code: info.code.into(),
                reason: info.reason.into(),
            })),
        }
    }
}

/// Notification the relay itself sends downstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProxyEvent {
    /// The upstream reported an error.
    #[serde(rename = "proxy.error")]
    Error {
        /// Error description.
        message: String,
    },
    /// The upstream closed or could not be reached.
    #[serde(rename = "proxy.closed")]
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

impl ProxyEvent {
    /// Encode as a text frame.
    ///
    /// # Errors
    /// Returns an error if the event cannot be serialized.
    pub fn to_frame(&self) -> RelayResult<RelayFrame> {
        Ok(RelayFrame::Text(serde_json::to_string(self)?))
    }
}
