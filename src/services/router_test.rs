use std::sync::{Arc, Mutex};

use frames::Command;

use super::*;
use crate::net::types::CHANNEL_STATE;

fn message(destination: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .with_header(frames::DESTINATION, destination)
        .with_header(frames::SUBSCRIPTION, "sub-1")
        .with_body(body)
}

fn collect(emitter: &EventEmitter<SyncEvent>, channel: &str) -> Arc<Mutex<Vec<InboundMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    emitter.on(channel, move |event: &SyncEvent| {
        if let Some(msg) = event.as_message() {
            sink.lock().unwrap().push(msg.clone());
        }
    });
    seen
}

#[test]
fn subscribe_all_covers_each_topic() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut router = TopicRouter::new(Topic::ALL.to_vec());

    assert_eq!(router.subscribe_all("trip-42", &tx), 3);

    let mut destinations = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        assert_eq!(frame.command, Command::Subscribe);
        destinations.push(frame.destination().unwrap().to_owned());
    }
    assert_eq!(
        destinations,
        vec!["/topic/itinerary/trip-42", "/topic/agent/trip-42", "/topic/chat/trip-42"]
    );
}

#[test]
fn resubscribe_cancels_previous_subscriptions_first() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut router = TopicRouter::new(vec![Topic::Chat]);
    router.subscribe_all("trip-1", &tx);
    let first = rx.try_recv().unwrap();
    let first_id = first.header(frames::ID).unwrap().to_owned();

    router.subscribe_all("trip-1", &tx);
    let cancel = rx.try_recv().unwrap();
    assert_eq!(cancel.command, Command::Unsubscribe);
    assert_eq!(cancel.header(frames::ID), Some(first_id.as_str()));

    let again = rx.try_recv().unwrap();
    assert_eq!(again.command, Command::Subscribe);
    assert_ne!(again.header(frames::ID), Some(first_id.as_str()));
    assert_eq!(router.subscriptions().len(), 1);
}

#[test]
fn empty_topic_set_subscribes_nothing() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut router = TopicRouter::new(Vec::new());
    assert_eq!(router.subscribe_all("trip-1", &tx), 0);
    assert!(rx.try_recv().is_err());
}

#[test]
fn closed_link_stops_subscribing() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let mut router = TopicRouter::new(Topic::ALL.to_vec());
    assert_eq!(router.subscribe_all("trip-1", &tx), 0);
}

#[test]
fn accepts_only_live_subscriptions() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut router = TopicRouter::new(vec![Topic::Chat]);
    router.subscribe_all("trip-1", &tx);
    let live = router.subscriptions()[&Topic::Chat].id.clone();

    let ours = Frame::new(Command::Message).with_header(frames::SUBSCRIPTION, live);
    let stale = Frame::new(Command::Message).with_header(frames::SUBSCRIPTION, "sub-999");
    let by_destination = Frame::new(Command::Message).with_header(frames::DESTINATION, "/topic/chat/trip-1");

    assert!(router.accepts(&ours));
    assert!(!router.accepts(&stale));
    assert!(router.accepts(&by_destination));

    router.forget_all();
    assert!(!router.accepts(&ours));
}

#[test]
fn typed_message_goes_to_generic_and_kind_channels() {
    let emitter = EventEmitter::new();
    let all = collect(&emitter, CHANNEL_MESSAGE);
    let progress = collect(&emitter, "agent_progress");
    let chat = collect(&emitter, "chat_response");

    let frame = message(
        "/topic/agent/trip-42",
        r#"{"type":"agent_progress","data":{"step":"planning"},"progress":40,"timestamp":"2026-03-01T10:00:00Z"}"#,
    );
    let msg = TopicRouter::on_frame("trip-42", &frame, &emitter);

    assert_eq!(msg.kind, MessageKind::AgentProgress);
    assert_eq!(msg.payload, serde_json::json!({"step": "planning"}));
    assert_eq!(msg.progress, Some(40.0));
    assert_eq!(msg.topic.as_deref(), Some("/topic/agent/trip-42"));
    assert_eq!(msg.timestamp.year(), 2026);

    assert_eq!(all.lock().unwrap().len(), 1);
    assert_eq!(progress.lock().unwrap().len(), 1);
    assert!(chat.lock().unwrap().is_empty());
}

#[test]
fn missing_type_is_connection_status_with_whole_body() {
    let emitter = EventEmitter::new();
    let status = collect(&emitter, "connection_status");

    let frame = message("/topic/itinerary/trip-1", r#"{"connected":true}"#);
    let msg = TopicRouter::on_frame("trip-1", &frame, &emitter);

    assert_eq!(msg.kind, MessageKind::ConnectionStatus);
    assert_eq!(msg.payload, serde_json::json!({"connected": true}));
    assert_eq!(status.lock().unwrap().len(), 1);
}

#[test]
fn unknown_type_routes_to_unknown_channel() {
    let emitter = EventEmitter::new();
    let unknown = collect(&emitter, "unknown");

    let frame = message("/topic/itinerary/trip-1", r#"{"type":"weather_alert","data":1}"#);
    let msg = TopicRouter::on_frame("trip-1", &frame, &emitter);

    assert_eq!(msg.kind, MessageKind::Unknown("weather_alert".into()));
    assert_eq!(unknown.lock().unwrap().len(), 1);
}

#[test]
fn malformed_body_emits_exactly_one_error() {
    let emitter = EventEmitter::new();
    let all = collect(&emitter, CHANNEL_MESSAGE);
    let errors = collect(&emitter, "error");
    let states = collect(&emitter, CHANNEL_STATE);

    let frame = message("/topic/chat/trip-1", "not json {");
    let msg = TopicRouter::on_frame("trip-1", &frame, &emitter);

    assert_eq!(msg.kind, MessageKind::Error);
    assert_eq!(msg.error_code(), Some("E_PARSE_JSON"));
    assert_eq!(msg.topic.as_deref(), Some("/topic/chat/trip-1"));
    assert_eq!(all.lock().unwrap().len(), 1);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(states.lock().unwrap().is_empty());
}

#[test]
fn empty_body_is_malformed() {
    let emitter = EventEmitter::new();
    let frame = message("/topic/chat/trip-1", "");
    assert_eq!(TopicRouter::on_frame("trip-1", &frame, &emitter).kind, MessageKind::Error);
}

#[test]
fn malformed_frame_reports_codec_error() {
    let emitter = EventEmitter::new();
    let errors = collect(&emitter, "error");

    let msg = TopicRouter::on_malformed("trip-1", "BOGUS\n\n\0", CodecError::UnknownCommand("BOGUS".into()), &emitter);

    assert_eq!(msg.error_code(), Some("E_PARSE_FRAME"));
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn epoch_millis_timestamp_is_accepted() {
    let frame = message("/topic/chat/trip-1", r#"{"type":"chat","timestamp":1700000000000}"#);
    let msg = parse_frame("trip-1", &frame).unwrap();
    assert_eq!(msg.timestamp.unix_timestamp(), 1_700_000_000);
}

#[test]
fn out_of_range_timestamp_falls_back_to_receipt_time() {
    let frame = message("/topic/chat/trip-1", r#"{"type":"chat","timestamp":9000000000000000000}"#);
    let msg = parse_frame("trip-1", &frame).unwrap();
    assert!((OffsetDateTime::now_utc() - msg.timestamp).whole_seconds().abs() < 60);
}

#[test]
fn non_object_body_is_whole_payload() {
    let frame = message("/topic/chat/trip-1", "[1,2,3]");
    let msg = parse_frame("trip-1", &frame).unwrap();
    assert_eq!(msg.kind, MessageKind::ConnectionStatus);
    assert_eq!(msg.payload, serde_json::json!([1, 2, 3]));
}
