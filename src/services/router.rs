//! Topic router: subscription bookkeeping and inbound frame demultiplexing.
//!
//! DESIGN
//! ======
//! One router lives inside each connection session. After every successful
//! connect the manager calls [`TopicRouter::subscribe_all`], which cancels
//! whatever the previous transport had subscribed and then subscribes the
//! configured topic set fresh, so a reconnect never delivers twice.
//!
//! Frame handling is an associated function rather than a method: the
//! manager decides under its session lock whether a `MESSAGE` belongs to a
//! live subscription, then parses and emits with the lock released.
//!
//! ENVELOPE
//! ========
//! ```text
//! { "type": "itinerary_updated", "data": {...}, "progress": 40, "timestamp": "..." }
//! ```
//! - `type` selects the [`MessageKind`]; absent means `ConnectionStatus`
//! - `data` becomes the payload; without it the whole body is the payload
//! - a body that is not JSON yields exactly one `Error` message

use std::collections::HashMap;

use frames::{CodecError, Frame};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::EventEmitter;
use crate::net::types::{
    CHANNEL_MESSAGE, ErrorCode, InboundMessage, MessageKind, SyncEvent, Topic, parse_timestamp,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message body is not valid JSON: {0}")]
    Json(String),
    #[error("malformed STOMP frame: {0}")]
    Frame(#[from] CodecError),
}

impl ErrorCode for ParseError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Json(_) => "E_PARSE_JSON",
            Self::Frame(_) => "E_PARSE_FRAME",
        }
    }
}

/// Broker-side subscription for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    topics: Vec<Topic>,
    subscriptions: HashMap<Topic, SubscriptionHandle>,
    next_sub: u64,
}

impl TopicRouter {
    #[must_use]
    pub fn new(topics: Vec<Topic>) -> Self {
        Self { topics, subscriptions: HashMap::new(), next_sub: 0 }
    }

    /// Cancel prior subscriptions, then subscribe every configured topic for
    /// `resource_id`. Returns how many subscriptions are now active.
    pub fn subscribe_all(&mut self, resource_id: &str, outbound: &mpsc::UnboundedSender<Frame>) -> usize {
        self.unsubscribe_all(outbound);

        for topic in &self.topics {
            self.next_sub += 1;
            let handle = SubscriptionHandle {
                id: format!("sub-{}", self.next_sub),
                destination: topic.destination(resource_id),
            };
            if outbound
                .send(Frame::subscribe(&handle.id, &handle.destination))
                .is_err()
            {
                warn!(%resource_id, topic = topic.name(), "router: link closed while subscribing");
                break;
            }
            debug!(%resource_id, id = %handle.id, destination = %handle.destination, "router: subscribed");
            self.subscriptions.insert(*topic, handle);
        }

        self.subscriptions.len()
    }

    /// Send `UNSUBSCRIBE` for every active subscription and forget them.
    pub fn unsubscribe_all(&mut self, outbound: &mpsc::UnboundedSender<Frame>) {
        for (topic, handle) in self.subscriptions.drain() {
            if outbound.send(Frame::unsubscribe(&handle.id)).is_err() {
                debug!(topic = topic.name(), id = %handle.id, "router: link already closed on unsubscribe");
            }
        }
    }

    /// Forget subscriptions without telling the broker (the link is gone).
    pub fn forget_all(&mut self) {
        self.subscriptions.clear();
    }

    /// Active subscriptions keyed by topic.
    #[must_use]
    pub fn subscriptions(&self) -> &HashMap<Topic, SubscriptionHandle> {
        &self.subscriptions
    }

    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Whether `frame` was delivered to one of our live subscriptions.
    ///
    /// Frames without a `subscription` header are matched by destination.
    #[must_use]
    pub fn accepts(&self, frame: &Frame) -> bool {
        match frame.header(frames::SUBSCRIPTION) {
            Some(id) => self.subscriptions.values().any(|h| h.id == id),
            None => frame
                .destination()
                .is_some_and(|dest| self.subscriptions.values().any(|h| h.destination == dest)),
        }
    }

    /// Parse one `MESSAGE` frame and emit the result. Never fails: a body
    /// that does not parse becomes an `Error` message.
    pub fn on_frame(resource_id: &str, frame: &Frame, emitter: &EventEmitter<SyncEvent>) -> InboundMessage {
        let msg = match parse_frame(resource_id, frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%resource_id, destination = frame.destination().unwrap_or("-"), error = %err, raw = %frame.body, "router: dropping malformed message body");
                InboundMessage::error_from(resource_id, &err).with_topic(frame.destination())
            }
        };
        dispatch(emitter, &msg);
        msg
    }

    /// Report inbound text the codec could not read as a frame.
    pub fn on_malformed(
        resource_id: &str,
        raw: &str,
        error: CodecError,
        emitter: &EventEmitter<SyncEvent>,
    ) -> InboundMessage {
        warn!(%resource_id, %error, %raw, "router: dropping malformed frame");
        let msg = InboundMessage::error_from(resource_id, &ParseError::Frame(error));
        dispatch(emitter, &msg);
        msg
    }
}

/// Emit `msg` on the generic message channel and on its kind channel.
pub fn dispatch(emitter: &EventEmitter<SyncEvent>, msg: &InboundMessage) {
    let event = SyncEvent::Message(msg.clone());
    emitter.emit(CHANNEL_MESSAGE, &event);
    emitter.emit(msg.kind.channel(), &event);
}

/// Turn a `MESSAGE` body into a typed message.
///
/// # Errors
///
/// Returns [`ParseError::Json`] when the body is not JSON.
pub fn parse_frame(resource_id: &str, frame: &Frame) -> Result<InboundMessage, ParseError> {
    let mut body: Value = serde_json::from_str(&frame.body).map_err(|e| ParseError::Json(e.to_string()))?;

    let kind = MessageKind::from_type_tag(body.get("type").and_then(Value::as_str));
    let progress = body
        .get("progress")
        .or_else(|| body.get("data").and_then(|d| d.get("progress")))
        .and_then(Value::as_f64);
    let timestamp = body
        .get("timestamp")
        .and_then(timestamp_from)
        .unwrap_or_else(OffsetDateTime::now_utc);
    let data = body.as_object_mut().and_then(|envelope| envelope.remove("data"));
    let payload = data.unwrap_or(body);

    let mut msg = InboundMessage::new(kind, resource_id, payload).with_topic(frame.destination());
    msg.progress = progress;
    msg.timestamp = timestamp;
    Ok(msg)
}

/// RFC 3339 strings or integer epoch milliseconds.
fn timestamp_from(raw: &Value) -> Option<OffsetDateTime> {
    match raw {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let millis = i128::from(n.as_i64()?);
            OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000).map_or_else(
                |err| {
                    debug!(millis, error = %err, "router: timestamp out of range; using receipt time");
                    None
                },
                Some,
            )
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
