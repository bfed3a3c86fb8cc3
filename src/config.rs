//! Configuration for the companion transport layer.
//!
//! Every section has sensible defaults and can be overridden from
//! `COMPANION_*` environment variables through [`CompanionConfig::from_env`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default system prompt for directly configured endpoints.
///
/// The `Current time:` line is re-stamped on every request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a warm, attentive companion. Keep replies short and conversational.
Current time: unknown";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid or unsupported value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompanionConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Chat pipeline settings.
    pub chat: ChatConfig,
    /// Realtime relay settings.
    pub relay: RelayConfig,
}

impl CompanionConfig {
    /// Build the configuration from defaults and environment overrides.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed or the result is invalid.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("COMPANION_PORT")? {
            config.server.port = port;
        }

        if let Some(transport) = TransportConfig::from_env() {
            config.chat.transport = transport;
        }
        if let Some(policy) = env_var("COMPANION_CHAT_OVERLAP") {
            config.chat.overlap = policy.parse()?;
        }
        if let Some(secs) = env_parse::<u64>("COMPANION_UNDO_SECONDS")? {
            config.chat.log.undo_window_secs = secs;
        }
        if let Some(path) = env_var("COMPANION_STORAGE_PATH") {
            config.chat.storage_path = PathBuf::from(path);
        }

        config.relay.apply_overrides(env_var);

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chat.validate()?;
        self.relay.validate()
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (all interfaces).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

/// Chat pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Where requests go.
    pub transport: TransportConfig,
    /// What happens when a turn is sent while another is still streaming.
    pub overlap: OverlapPolicy,
    /// Message log settings.
    pub log: LogConfig,
    /// Rolling summary settings.
    pub summary: SummaryConfig,
    /// User-facing failure texts.
    pub errors: ErrorTexts,
    /// `SQLite` file used by the terminal client.
    pub storage_path: PathBuf,
    /// Connect timeout for the HTTP client, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            overlap: OverlapPolicy::default(),
            log: LogConfig::default(),
            summary: SummaryConfig::default(),
            errors: ErrorTexts::default(),
            storage_path: PathBuf::from("companion.sqlite"),
            connect_timeout_secs: 10,
        }
    }
}

impl ChatConfig {
    /// Validate chat settings.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.log.max_persisted == 0 {
            return Err(ConfigError::Invalid(
                "chat.log.max_persisted must be > 0".to_string(),
            ));
        }

        if self.summary.window == 0 {
            return Err(ConfigError::Invalid(
                "chat.summary.window must be > 0".to_string(),
            ));
        }

        if self.summary.interval_turns == 0 {
            return Err(ConfigError::Invalid(
                "chat.summary.interval_turns must be > 0".to_string(),
            ));
        }

        match &self.transport {
            TransportConfig::Custom {
                endpoint, model, ..
            } => {
                Url::parse(endpoint)?;
                if model.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "chat.transport.model must not be empty".to_string(),
                    ));
                }
            }
            TransportConfig::Gateway { base_url, .. } => {
                Url::parse(base_url)?;
            }
        }

        Ok(())
    }
}

/// Outbound chat transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// A directly configured OpenAI-compatible endpoint.
    Custom {
        /// Base URL or full chat-completions URL.
        endpoint: String,
        /// Bearer token.
        api_key: String,
        /// Model name sent in the request body.
        model: String,
        /// Locally embedded system prompt, re-stamped with the current time.
        system_prompt: String,
    },
    /// The managed gateway function.
    Gateway {
        /// Gateway base URL; `/functions/v1/chat` is appended.
        base_url: String,
        /// Bearer token for the gateway.
        token: String,
        /// System prompt supplied by the server-side settings.
        system_prompt: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Gateway {
            base_url: "http://127.0.0.1:54321".to_string(),
            token: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl TransportConfig {
    /// Pick a transport from the environment.
    ///
    /// A custom endpoint wins when `COMPANION_CHAT_ENDPOINT` is set; the gateway
    /// is used when `COMPANION_GATEWAY_URL` is set. Returns `None` otherwise.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let system_prompt =
            env_var("COMPANION_SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        if let Some(endpoint) = env_var("COMPANION_CHAT_ENDPOINT") {
            return Some(Self::Custom {
                endpoint,
                api_key: env_var("COMPANION_CHAT_API_KEY").unwrap_or_default(),
                model: env_var("COMPANION_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                system_prompt,
            });
        }

        env_var("COMPANION_GATEWAY_URL").map(|base_url| Self::Gateway {
            base_url,
            token: env_var("COMPANION_GATEWAY_TOKEN").unwrap_or_default(),
            system_prompt: env_var("COMPANION_GATEWAY_SYSTEM_PROMPT").unwrap_or(system_prompt),
        })
    }
}

/// Behavior of a send while a previous turn is still streaming.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Wait for the in-flight turn to finish before starting.
    #[default]
    Queue,
    /// Abandon the in-flight stream; its partial content is kept.
    CancelPrevious,
    /// Run both; each owns its own in-progress assistant message.
    Concurrent,
}

impl std::str::FromStr for OverlapPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "cancel_previous" | "cancel" => Ok(Self::CancelPrevious),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(ConfigError::Invalid(format!(
                "unknown overlap policy: {other}"
            ))),
        }
    }
}

/// Message log settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Storage key holding the persisted sequence.
    pub storage_key: String,
    /// Number of most recent messages written to storage.
    pub max_persisted: usize,
    /// How long a delete/clear can be undone, in seconds.
    pub undo_window_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            storage_key: "companion.messages".to_string(),
            max_persisted: 100,
            undo_window_secs: 10,
        }
    }
}

/// Rolling summary settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Number of recent turns always sent verbatim.
    pub window: usize,
    /// Number of uncovered turns beyond the window that triggers a fold.
    pub interval_turns: usize,
    /// Max summary size in characters.
    pub max_chars: usize,
    /// Storage key holding the summary.
    pub storage_key: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            window: 6,
            interval_turns: 8,
            max_chars: 1200,
            storage_key: "companion.summary".to_string(),
        }
    }
}

/// Texts used for failed turns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorTexts {
    /// HTTP 429.
    pub rate_limited: String,
    /// HTTP 402.
    pub quota_exhausted: String,
    /// HTTP 401.
    pub unauthorized: String,
    /// Anything else; `{detail}` is replaced with the cause.
    pub generic: String,
}

impl Default for ErrorTexts {
    fn default() -> Self {
        Self {
            rate_limited: "Too many requests right now. Please wait a moment and try again."
                .to_string(),
            quota_exhausted: "The usage quota is exhausted. Please add credits to continue."
                .to_string(),
            unauthorized: "The API key was rejected. Please check your credentials.".to_string(),
            generic: "Sorry, something went wrong ({detail}).".to_string(),
        }
    }
}

/// Realtime relay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream realtime WebSocket URL.
    pub upstream_url: String,
    /// Upstream credential, if any.
    pub api_key: Option<String>,
    /// Capability sub-protocol always advertised upstream and accepted downstream.
    pub capability_protocol: String,
    /// Prefix of the sub-protocol token carrying the credential.
    pub credential_protocol_prefix: String,
    /// Extra sub-protocol tokens always advertised upstream.
    pub extra_protocols: Vec<String>,
    /// Query parameter used when the credential is not a valid token.
    pub credential_query_param: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
                .to_string(),
            api_key: None,
            capability_protocol: "realtime".to_string(),
            credential_protocol_prefix: "openai-insecure-api-key.".to_string(),
            extra_protocols: vec!["openai-beta.realtime-v1".to_string()],
            credential_query_param: "api_key".to_string(),
        }
    }
}

impl RelayConfig {
    /// Apply `COMPANION_REALTIME_*` overrides read through `lookup`.
    ///
    /// `COMPANION_REALTIME_EXTRA_PROTOCOLS` is a comma-separated list and
    /// replaces the defaults.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("COMPANION_REALTIME_URL") {
            self.upstream_url = url;
        }
        self.api_key = lookup("COMPANION_REALTIME_API_KEY");
        if let Some(protocol) = lookup("COMPANION_REALTIME_PROTOCOL") {
            self.capability_protocol = protocol;
        }
        if let Some(prefix) = lookup("COMPANION_REALTIME_KEY_PREFIX") {
            self.credential_protocol_prefix = prefix;
        }
        if let Some(extra) = lookup("COMPANION_REALTIME_EXTRA_PROTOCOLS") {
            self.extra_protocols = extra
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(param) = lookup("COMPANION_REALTIME_KEY_PARAM") {
            self.credential_query_param = param;
        }
    }

    /// Validate relay settings.
    ///
    /// # Errors
    /// Returns an error if the upstream URL is not a WebSocket URL.
    pub fn validate(&self) -> ConfigResult<()> {
        let url = Url::parse(&self.upstream_url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::Invalid(format!(
                "relay.upstream_url must use ws or wss, got {}",
                url.scheme()
            )));
        }

        if self.capability_protocol.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "relay.capability_protocol must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> ConfigResult<Option<T>> {
    env_var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value: {raw}")))
        })
        .transpose()
}
