//! Typed messages and records exchanged with the itinerary backend.
//!
//! SYSTEM CONTEXT
//! ==============
//! The broker pushes JSON envelopes (`type`, `data`, `progress`,
//! `timestamp`) on resource-scoped topics. The router turns each envelope
//! into an [`InboundMessage`] with a closed [`MessageKind`]; the connection
//! manager wraps those and its own state transitions in [`SyncEvent`]s.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

// =============================================================================
// EVENT CHANNELS
// =============================================================================

/// Channel carrying [`SyncEvent::StateChanged`].
pub const CHANNEL_STATE: &str = "state";

/// Channel carrying every [`SyncEvent::Message`], whatever its kind.
pub const CHANNEL_MESSAGE: &str = "message";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for `Error`-kind messages.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Lifecycle of one resource's real-time session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TOPICS
// =============================================================================

/// Server-push topics scoped to a resource id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Structural itinerary changes (`/topic/itinerary/{id}`).
    Itinerary,
    /// Agent/task progress (`/topic/agent/{id}`).
    Agent,
    /// Assistant chat replies (`/topic/chat/{id}`).
    Chat,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Itinerary, Topic::Agent, Topic::Chat];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Itinerary => "itinerary",
            Self::Agent => "agent",
            Self::Chat => "chat",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.name().eq_ignore_ascii_case(raw.trim()))
    }

    /// Broker destination for this topic and resource.
    #[must_use]
    pub fn destination(self, resource_id: &str) -> String {
        format!("/topic/{}/{}", self.name(), path_segment(resource_id))
    }
}

/// Client-to-server destination for chat submissions.
#[must_use]
pub fn chat_destination(resource_id: &str) -> String {
    format!("/app/chat/{}", path_segment(resource_id))
}

/// `resource_id` as a single path segment. Anything outside the URL
/// unreserved set is percent-encoded, so `/`, `?`, `#` and spaces cannot
/// reshape a REST path or broker destination.
#[must_use]
pub fn path_segment(resource_id: &str) -> Cow<'_, str> {
    urlencoding::encode(resource_id)
}

// =============================================================================
// MESSAGE KIND
// =============================================================================

/// Closed set of inbound message kinds, with a forward-compatible fallback.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ItineraryUpdated,
    AgentProgress,
    ChatResponse,
    Error,
    ConnectionStatus,
    /// A `type` tag this client does not know. Carries the raw tag.
    Unknown(String),
}

impl MessageKind {
    /// Map the envelope's `type` field. An absent tag means `ConnectionStatus`.
    ///
    /// Tags compare case-insensitively with `-` and spaces read as `_`.
    #[must_use]
    pub fn from_type_tag(tag: Option<&str>) -> Self {
        let Some(raw) = tag else {
            return Self::ConnectionStatus;
        };
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "itinerary_updated" | "itinerary_update" | "itinerary" => Self::ItineraryUpdated,
            "agent_progress" | "progress" | "task_progress" => Self::AgentProgress,
            "chat_response" | "chat" | "chat_message" => Self::ChatResponse,
            "error" => Self::Error,
            "connection_status" | "status" => Self::ConnectionStatus,
            _ => Self::Unknown(raw.to_owned()),
        }
    }

    /// Emitter channel for messages of this kind.
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ItineraryUpdated => "itinerary_updated",
            Self::AgentProgress => "agent_progress",
            Self::ChatResponse => "chat_response",
            Self::Error => "error",
            Self::ConnectionStatus => "connection_status",
            Self::Unknown(_) => "unknown",
        }
    }
}

// =============================================================================
// INBOUND MESSAGE
// =============================================================================

/// A typed server push (or a locally raised error) for one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub resource_id: String,
    /// Broker destination the frame arrived on, if it came from a topic.
    pub topic: Option<String>,
    pub payload: Value,
    pub progress: Option<f64>,
    pub timestamp: OffsetDateTime,
}

impl InboundMessage {
    #[must_use]
    pub fn new(kind: MessageKind, resource_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
            topic: None,
            payload,
            progress: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// `Error`-kind message from a plain description.
    #[must_use]
    pub fn error(resource_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.into()));
        Self::new(MessageKind::Error, resource_id, Value::Object(data))
    }

    /// `Error`-kind message from a typed error.
    #[must_use]
    pub fn error_from(resource_id: impl Into<String>, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Map::new();
        data.insert("code".into(), Value::String(err.error_code().to_owned()));
        data.insert("message".into(), Value::String(err.to_string()));
        data.insert("retryable".into(), Value::Bool(err.retryable()));
        Self::new(MessageKind::Error, resource_id, Value::Object(data))
    }

    #[must_use]
    pub fn with_topic(mut self, topic: Option<&str>) -> Self {
        self.topic = topic.map(ToOwned::to_owned);
        self
    }

    /// `message` field of an error payload.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// `code` field of an error payload.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.payload.get("code").and_then(Value::as_str)
    }

    /// Flat JSON rendering for logs and the CLI.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "kind": self.kind.channel(),
            "type": match &self.kind {
                MessageKind::Unknown(tag) => Value::String(tag.clone()),
                _ => Value::Null,
            },
            "resourceId": self.resource_id,
            "topic": self.topic,
            "payload": self.payload,
            "progress": self.progress,
            "timestamp": self.timestamp.format(&Rfc3339).unwrap_or_default(),
        })
    }
}

/// Parse an RFC 3339 timestamp, if well formed.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_or_else(
        |err| {
            debug!(raw, error = %err, "types: unparseable timestamp");
            None
        },
        Some,
    )
}

// =============================================================================
// SYNC EVENT
// =============================================================================

/// Payload emitted by the connection manager.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StateChanged { resource_id: String, state: ConnectionState },
    Message(InboundMessage),
}

impl SyncEvent {
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::StateChanged { resource_id, .. } => resource_id,
            Self::Message(msg) => &msg.resource_id,
        }
    }

    #[must_use]
    pub fn as_message(&self) -> Option<&InboundMessage> {
        match self {
            Self::Message(msg) => Some(msg),
            Self::StateChanged { .. } => None,
        }
    }
}

// =============================================================================
// REVISIONS
// =============================================================================

/// One entry of the server-held linear revision history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    #[serde(alias = "versionNumber", alias = "revision")]
    pub version: i64,
    #[serde(default, alias = "is_current", alias = "current")]
    pub is_current: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<String>,
}

// =============================================================================
// REORDER
// =============================================================================

/// Ordered activity ids within one itinerary day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayOrder {
    pub day_id: String,
    pub activity_ids: Vec<String>,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
