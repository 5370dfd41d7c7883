//! Sync configuration parsed from environment variables.
//!
//! The transport endpoint is either given explicitly (`ITINERARY_WS_URL`) or
//! synthesized from the REST base URL by swapping the scheme (`http` → `ws`,
//! `https` → `wss`) and appending [`WS_PATH`].

use std::time::Duration;

use tracing::warn;

use crate::net::types::Topic;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
pub const WS_PATH: &str = "/ws";

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MIN_ATTEMPT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A URL does not start with a scheme this client can speak.
    #[error("unsupported URL scheme in {var}: {value}")]
    UnsupportedScheme { var: &'static str, value: String },
    /// `ITINERARY_TOPICS` names a topic outside the fixed set.
    #[error("unknown topic in ITINERARY_TOPICS: {0}")]
    UnknownTopic(String),
}

impl crate::net::types::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedScheme { .. } => "E_CONFIG_URL",
            Self::UnknownTopic(_) => "E_CONFIG_TOPIC",
        }
    }
}

/// Bounded automatic reconnection after an established session drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before the session is parked in `Error`. Zero disables.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn disabled() -> Self {
        Self { max_attempts: 0, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Un-jittered delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// STOMP-over-WebSocket endpoint.
    pub ws_url: String,
    /// REST base for revision and reorder endpoints, without trailing slash.
    pub api_base_url: String,
    /// Bearer token sent to REST endpoints and in the STOMP `CONNECT` frame.
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    /// Minimum spacing between connection attempts for one resource.
    pub min_attempt_interval: Duration,
    /// Upper bound for save, undo, redo and revision queries.
    pub request_timeout: Duration,
    /// Client heart-beat period. Zero disables heart-beats.
    pub heartbeat: Duration,
    pub reconnect: ReconnectPolicy,
    /// Topics subscribed for every resource, in subscription order.
    pub topics: Vec<Topic>,
}

impl SyncConfig {
    /// Defaults around an explicit REST base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedScheme`] when the base URL is not
    /// `http://` or `https://`.
    pub fn new(api_base_url: &str) -> Result<Self, ConfigError> {
        let api_base_url = api_base_url.trim_end_matches('/').to_owned();
        let ws_url = ws_url_from_api_base(&api_base_url)?;
        Ok(Self {
            ws_url,
            api_base_url,
            auth_token: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            min_attempt_interval: Duration::from_millis(DEFAULT_MIN_ATTEMPT_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            reconnect: ReconnectPolicy::default(),
            topics: Topic::ALL.to_vec(),
        })
    }

    /// Build typed sync config from environment variables.
    ///
    /// Optional:
    /// - `ITINERARY_API_BASE_URL`: default `http://localhost:8080/api`
    /// - `ITINERARY_WS_URL`: explicit transport endpoint
    /// - `ITINERARY_AUTH_TOKEN`
    /// - `ITINERARY_CONNECT_TIMEOUT_MS`: default 15000
    /// - `ITINERARY_MIN_ATTEMPT_INTERVAL_MS`: default 5000
    /// - `ITINERARY_REQUEST_TIMEOUT_MS`: default 30000
    /// - `ITINERARY_HEARTBEAT_MS`: default 10000, 0 disables
    /// - `ITINERARY_RECONNECT_MAX_ATTEMPTS`: default 5, 0 disables
    /// - `ITINERARY_RECONNECT_BASE_DELAY_MS`: default 1000
    /// - `ITINERARY_RECONNECT_MAX_DELAY_MS`: default 10000
    /// - `ITINERARY_TOPICS`: comma list from `itinerary,agent,chat`
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unusable URLs or unknown topic names.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_var)
    }

    /// Same as [`SyncConfig::from_env`] but reading from `lookup`.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base = lookup("ITINERARY_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        let mut config = Self::new(&api_base)?;

        if let Some(ws_url) = lookup("ITINERARY_WS_URL").filter(|v| !v.trim().is_empty()) {
            config.set_ws_url(&ws_url)?;
        }
        config.auth_token = lookup("ITINERARY_AUTH_TOKEN").filter(|v| !v.is_empty());

        let millis = |key: &str, default: u64| Duration::from_millis(parse_or(&lookup, key, default));
        config.connect_timeout = millis("ITINERARY_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS);
        config.min_attempt_interval = millis("ITINERARY_MIN_ATTEMPT_INTERVAL_MS", DEFAULT_MIN_ATTEMPT_INTERVAL_MS);
        config.request_timeout = millis("ITINERARY_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS);
        config.heartbeat = millis("ITINERARY_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS);
        config.reconnect = ReconnectPolicy {
            max_attempts: parse_or(&lookup, "ITINERARY_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS),
            base_delay: millis("ITINERARY_RECONNECT_BASE_DELAY_MS", DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: millis("ITINERARY_RECONNECT_MAX_DELAY_MS", DEFAULT_RECONNECT_MAX_DELAY_MS),
        };

        if let Some(raw) = lookup("ITINERARY_TOPICS") {
            config.topics = parse_topics(&raw)?;
        }

        Ok(config)
    }

    /// Replace the synthesized WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedScheme`] unless `raw` is `ws://` or
    /// `wss://`.
    pub fn set_ws_url(&mut self, raw: &str) -> Result<(), ConfigError> {
        self.ws_url = validate_ws_url(raw.trim())?;
        Ok(())
    }

    /// Value for the STOMP `host` header: the authority of [`Self::ws_url`].
    #[must_use]
    pub fn stomp_host(&self) -> &str {
        let rest = self
            .ws_url
            .split_once("://")
            .map_or(self.ws_url.as_str(), |(_, rest)| rest);
        rest.split(['/', '?']).next().unwrap_or(rest)
    }
}

/// Derive the transport URL from the REST base URL.
///
/// # Errors
///
/// Returns [`ConfigError::UnsupportedScheme`] for non-HTTP(S) bases.
pub fn ws_url_from_api_base(api_base_url: &str) -> Result<String, ConfigError> {
    let trimmed = api_base_url.trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}{WS_PATH}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}{WS_PATH}"));
    }

    Err(ConfigError::UnsupportedScheme { var: "ITINERARY_API_BASE_URL", value: api_base_url.to_owned() })
}

fn validate_ws_url(raw: &str) -> Result<String, ConfigError> {
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        Ok(raw.to_owned())
    } else {
        Err(ConfigError::UnsupportedScheme { var: "ITINERARY_WS_URL", value: raw.to_owned() })
    }
}

fn parse_topics(raw: &str) -> Result<Vec<Topic>, ConfigError> {
    let mut topics = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let topic = Topic::parse(name).ok_or_else(|| ConfigError::UnknownTopic(name.to_owned()))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Ok(topics)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => Some(value),
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(raw)) => {
            warn!(key, value = ?raw, "ignoring non-UTF-8 config value");
            None
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
