use super::*;

fn message_frame() -> Frame {
    Frame::new(Command::Message)
        .with_header(DESTINATION, "/topic/itinerary/trip-42")
        .with_header(SUBSCRIPTION, "sub-0")
        .with_header("message-id", "m-1")
        .with_body(r#"{"type":"itinerary_updated","data":{"days":3}}"#)
}

#[test]
fn command_wire_spelling_matches_stomp() {
    assert_eq!(Command::Connect.as_str(), "CONNECT");
    assert_eq!(Command::Unsubscribe.as_str(), "UNSUBSCRIBE");
    assert_eq!(Command::Receipt.to_string(), "RECEIPT");
    assert_eq!(Command::parse("ERROR").expect("command"), Command::Error);
}

#[test]
fn command_parse_rejects_lowercase() {
    let err = Command::parse("send").expect_err("lowercase should fail");
    assert_eq!(err, CodecError::UnknownCommand("send".to_owned()));
}

#[test]
fn encode_writes_command_headers_blank_line_and_nul() {
    let frame = Frame::subscribe("sub-0", "/topic/chat/trip-42");
    let text = encode_frame(&frame);
    assert_eq!(
        text,
        "SUBSCRIBE\nid:sub-0\ndestination:/topic/chat/trip-42\nack:auto\n\n\0"
    );
}

#[test]
fn encode_adds_content_length_for_body() {
    let text = encode_frame(&Frame::send("/app/chat/trip-42", r#"{"message":"hé"}"#));
    // "hé" is three bytes in UTF-8.
    assert!(text.contains("content-length:17\n"), "{text}");
    assert!(text.ends_with("{\"message\":\"hé\"}\0"));
}

#[test]
fn encode_keeps_explicit_content_length() {
    let frame = Frame::new(Command::Send)
        .with_header(CONTENT_LENGTH, "2")
        .with_body("{}");
    let text = encode_frame(&frame);
    assert_eq!(text.matches("content-length").count(), 1);
}

#[test]
fn decode_reads_message_frame() {
    let frame = message_frame();
    let decoded = decode_frame(&encode_frame(&frame))
        .expect("decode")
        .expect("frame");
    assert_eq!(decoded.command, Command::Message);
    assert_eq!(decoded.destination(), Some("/topic/itinerary/trip-42"));
    assert_eq!(decoded.header(SUBSCRIPTION), Some("sub-0"));
    assert_eq!(decoded.body, frame.body);
}

#[test]
fn decode_without_content_length_stops_at_nul() {
    let decoded = decode_frame("MESSAGE\ndestination:/topic/agent/t\n\n{\"a\":1}\0\n")
        .expect("decode")
        .expect("frame");
    assert_eq!(decoded.body, "{\"a\":1}");
}

#[test]
fn decode_accepts_crlf_line_endings() {
    let decoded = decode_frame("CONNECTED\r\nversion:1.2\r\n\r\n\0")
        .expect("decode")
        .expect("frame");
    assert_eq!(decoded.command, Command::Connected);
    assert_eq!(decoded.header("version"), Some("1.2"));
}

#[test]
fn heart_beat_decodes_to_nothing() {
    assert_eq!(decode_frame("\n").expect("decode"), None);
    assert_eq!(decode_frame("\r\n\n").expect("decode"), None);
    assert!(decode_frames("\n\n").expect("decode").is_empty());
}

#[test]
fn header_escapes_survive_encoding() {
    let frame = Frame::new(Command::Error)
        .with_header(MESSAGE, "bad: line\nnext\\end")
        .with_body("details");
    let text = encode_frame(&frame);
    assert!(text.contains("message:bad\\c line\\nnext\\\\end\n"), "{text}");

    let decoded = decode_frame(&text).expect("decode").expect("frame");
    assert_eq!(decoded.header(MESSAGE), Some("bad: line\nnext\\end"));
}

#[test]
fn connect_headers_are_not_escaped() {
    let text = encode_frame(&Frame::connect("api.example.com:443", (10_000, 10_000)));
    assert!(text.contains("host:api.example.com:443\n"), "{text}");
    assert!(text.contains("heart-beat:10000,10000\n"), "{text}");

    let decoded = decode_frame(&text).expect("decode").expect("frame");
    assert_eq!(decoded.header("host"), Some("api.example.com:443"));
}

#[test]
fn repeated_header_keeps_first_value() {
    let decoded = decode_frame("MESSAGE\nfoo:first\nfoo:second\n\n\0")
        .expect("decode")
        .expect("frame");
    assert_eq!(decoded.header("foo"), Some("first"));
    assert_eq!(decoded.headers.len(), 2);
}

#[test]
fn decode_frames_splits_packed_message() {
    let packed = format!(
        "{}\n{}",
        encode_frame(&message_frame()),
        encode_frame(&Frame::new(Command::Receipt).with_header(RECEIPT_ID, "r-1"))
    );
    let frames = decode_frames(&packed).expect("decode");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].command, Command::Message);
    assert_eq!(frames[1].header(RECEIPT_ID), Some("r-1"));
}

#[test]
fn content_length_allows_nul_inside_body() {
    let text = "MESSAGE\ncontent-length:3\n\na\0b\0";
    let decoded = decode_frame(text).expect("decode").expect("frame");
    assert_eq!(decoded.body, "a\0b");
}

#[test]
fn decode_rejects_unknown_command() {
    let err = decode_frame("HELLO\n\n\0").expect_err("should fail");
    assert!(matches!(err, CodecError::UnknownCommand(_)));
}

#[test]
fn decode_rejects_header_without_colon() {
    let err = decode_frame("MESSAGE\nbroken\n\n\0").expect_err("should fail");
    assert_eq!(err, CodecError::MalformedHeader("broken".to_owned()));
}

#[test]
fn decode_rejects_undefined_escape() {
    let err = decode_frame("MESSAGE\nfoo:a\\tb\n\n\0").expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidEscape(_)));
}

#[test]
fn decode_rejects_missing_terminator() {
    let err = decode_frame("MESSAGE\n\n{}").expect_err("should fail");
    assert_eq!(err, CodecError::MissingTerminator);
}

#[test]
fn decode_rejects_truncated_headers() {
    let err = decode_frame("MESSAGE\nfoo:bar").expect_err("should fail");
    assert_eq!(err, CodecError::Truncated);
}

#[test]
fn decode_rejects_oversized_content_length() {
    let err = decode_frame("MESSAGE\ncontent-length:99\n\n{}\0").expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidContentLength(_)));
}

#[test]
fn disconnect_carries_optional_receipt() {
    assert_eq!(Frame::disconnect(None).header(RECEIPT), None);
    assert_eq!(Frame::disconnect(Some("bye")).header(RECEIPT), Some("bye"));
}

#[test]
fn command_serializes_as_uppercase_json() {
    assert_eq!(
        serde_json::to_string(&Command::Message).expect("serialize"),
        "\"MESSAGE\""
    );
}
