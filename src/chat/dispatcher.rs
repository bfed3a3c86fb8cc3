//! Outbound chat requests and failure classification.
//!
//! The dispatcher turns a context window into a streaming chat-completions
//! request for the configured transport, issues it and exposes the response
//! body as a [`DeltaStream`]. Failures are classified into
//! [`DispatchFailure`] so the conversation can render them as assistant turns.

use std::borrow::Cow;
use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Timelike};
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::{Captures, Regex};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::chat::decoder::DeltaStream;
use crate::chat::error::ChatResult;
use crate::config::{ChatConfig, ErrorTexts, TransportConfig};
use crate::memory::collaborator::ContextTurn;

const COMPLETIONS_SUFFIX: &str = "/chat/completions";
const GATEWAY_CHAT_PATH: &str = "/functions/v1/chat";
const TIME_MARKER_PATTERN: &str = r"(?im)^(?P<label>[ \t]*current time:)[^\n]*$";
const IMAGE_DETAIL: &str = "low";

/// Raw response body.
pub type BodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Deltas decoded from a streaming response.
pub type ChatStream = DeltaStream<BodyStream>;

/// A request ready to be sent.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    /// Target URL.
    pub url: Url,
    /// Bearer credential; omitted from the request when empty.
    pub bearer: String,
    /// JSON body.
    pub body: serde_json::Value,
}

/// Why a request produced no stream, or why a stream ended early.
#[derive(Debug, Error)]
pub enum DispatchFailure {
    /// HTTP 429.
    #[error("rate limited")]
    RateLimited,
    /// HTTP 402.
    #[error("quota exhausted")]
    QuotaExhausted,
    /// HTTP 401.
    #[error("unauthorized")]
    Unauthorized,
    /// Any other non-success status.
    #[error("HTTP {0}")]
    Status(u16),
    /// Connection or body read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl DispatchFailure {
    /// Classify a non-success HTTP status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            402 => Self::QuotaExhausted,
            401 => Self::Unauthorized,
            other => Self::Status(other),
        }
    }

    /// Text shown to the user as the assistant turn for this failure.
    #[must_use]
    pub fn user_text(&self, texts: &ErrorTexts) -> String {
        match self {
            Self::RateLimited => texts.rate_limited.clone(),
            Self::QuotaExhausted => texts.quota_exhausted.clone(),
            Self::Unauthorized => texts.unauthorized.clone(),
            Self::Status(_) | Self::Transport(_) => {
                texts.generic.replace("{detail}", &self.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Serialize)]
struct ImageRef {
    url: String,
    detail: &'static str,
}

#[derive(Serialize)]
struct CompletionsBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayBody<'a> {
    messages: Vec<WireMessage>,
    system_prompt: &'a str,
}

/// Issues chat requests for one configured transport.
pub struct ChatDispatcher {
    client: Client,
    transport: TransportConfig,
    errors: ErrorTexts,
    time_marker: Regex,
}

impl ChatDispatcher {
    /// Build a dispatcher from chat settings.
    ///
    /// # Errors
    /// Returns an error if the HTTP client or the time marker pattern cannot
    /// be built.
    pub fn new(config: &ChatConfig) -> ChatResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            transport: config.transport.clone(),
            errors: config.errors.clone(),
            time_marker: Regex::new(TIME_MARKER_PATTERN)?,
        })
    }

    /// Failure texts in use.
    #[must_use]
    pub const fn error_texts(&self) -> &ErrorTexts {
        &self.errors
    }

    /// Shape the request for `context` at the local moment `now`.
    ///
    /// # Errors
    /// Returns an error if the endpoint is not a valid URL or the body cannot
    /// be serialized.
    pub fn build_request<Tz>(
        &self,
        context: &[ContextTurn],
        now: &DateTime<Tz>,
    ) -> ChatResult<OutboundRequest>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        match &self.transport {
            TransportConfig::Custom {
                endpoint,
                api_key,
                model,
                system_prompt,
            } => {
                let stamped = self.stamp_system_prompt(system_prompt, now);
                let mut messages = Vec::with_capacity(context.len() + 1);
                messages.push(WireMessage {
                    role: "system",
                    content: WireContent::Text(stamped.into_owned()),
                });
                messages.extend(wire_messages(context));

                let body = serde_json::to_value(CompletionsBody {
                    model,
                    messages,
                    stream: true,
                })?;

                Ok(OutboundRequest {
                    url: normalize_endpoint(endpoint)?,
                    bearer: api_key.clone(),
                    body,
                })
            }
            TransportConfig::Gateway {
                base_url,
                token,
                system_prompt,
            } => {
                let url = Url::parse(&format!(
                    "{}{GATEWAY_CHAT_PATH}",
                    base_url.trim().trim_end_matches('/')
                ))?;
                let body = serde_json::to_value(GatewayBody {
                    messages: wire_messages(context).collect(),
                    system_prompt,
                })?;

                Ok(OutboundRequest {
                    url,
                    bearer: token.clone(),
                    body,
                })
            }
        }
    }

    /// Send `request` and return its decoded delta stream.
    ///
    /// # Errors
    /// Returns the classified failure for transport errors and non-success
    /// statuses.
    pub async fn open_stream(&self, request: OutboundRequest) -> Result<ChatStream, DispatchFailure> {
        debug!("POST {}", request.url);

        let mut builder = self
            .client
            .post(request.url)
            .header(ACCEPT, "text/event-stream")
            .json(&request.body);
        if !request.bearer.is_empty() {
            builder = builder.bearer_auth(&request.bearer);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchFailure::from_status(status.as_u16()));
        }

        Ok(DeltaStream::new(response.bytes_stream().boxed()))
    }

    /// Replace every `current time:` line of `prompt` with the local moment.
    #[must_use]
    pub fn stamp_system_prompt<'p, Tz>(&self, prompt: &'p str, now: &DateTime<Tz>) -> Cow<'p, str>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let stamp = format!(
            "{} ({})",
            now.format("%A, %B %-d, %Y %H:%M"),
            day_period(now.hour())
        );
        self.time_marker
            .replace_all(prompt, |caps: &Captures<'_>| format!("{} {stamp}", &caps["label"]))
    }
}

/// Append `/chat/completions` to `endpoint` unless it already ends with it.
///
/// # Errors
/// Returns an error if the result is not a valid URL.
pub fn normalize_endpoint(endpoint: &str) -> ChatResult<Url> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let full = if trimmed.ends_with(COMPLETIONS_SUFFIX) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{COMPLETIONS_SUFFIX}")
    };
    Ok(Url::parse(&full)?)
}

/// Label of the part of the day for a local hour.
#[must_use]
pub const fn day_period(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

/// Wire form of the context; only the latest turn may carry an image.
fn wire_messages(context: &[ContextTurn]) -> impl Iterator<Item = WireMessage> + '_ {
    let last = context.len().saturating_sub(1);
    context.iter().enumerate().map(move |(index, turn)| {
        let content = match (&turn.image_url, index == last) {
            (Some(url), true) => WireContent::Parts(vec![
                WirePart::Text {
                    text: turn.content.clone(),
                },
                WirePart::ImageUrl {
                    image_url: ImageRef {
                        url: url.clone(),
                        detail: IMAGE_DETAIL,
                    },
                },
            ]),
            _ => WireContent::Text(turn.content.clone()),
        };
        WireMessage {
            role: turn.role.as_str(),
            content,
        }
    })
}
