//! Shared STOMP frame model and text codec for the realtime WS transport.
//!
//! This crate owns the wire representation used by both the sync library and
//! the `cli`. Frames travel as WebSocket text messages, one or more frames per
//! message, following STOMP 1.2:
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```
//!
//! DESIGN
//! ======
//! - Bodies are kept as `String`; every payload on this channel is JSON.
//! - Header values are escaped (`\\`, `\n`, `\r`, `\c`) on every frame except
//!   `CONNECT` and `CONNECTED`, which STOMP 1.2 leaves unescaped.
//! - A message made only of end-of-line bytes is a heart-beat and decodes to
//!   no frames.
//! - Repeated headers keep their first value, per STOMP 1.2.

use serde::{Deserialize, Serialize};

/// Header carrying the byte length of the body.
pub const CONTENT_LENGTH: &str = "content-length";
/// Header carrying the body MIME type.
pub const CONTENT_TYPE: &str = "content-type";
/// Header naming the target or source destination.
pub const DESTINATION: &str = "destination";
/// Header carrying the client-chosen subscription id.
pub const ID: &str = "id";
/// Header echoing the subscription id on `MESSAGE` frames.
pub const SUBSCRIPTION: &str = "subscription";
/// Header carrying the short error description on `ERROR` frames.
pub const MESSAGE: &str = "message";
/// Header requesting or acknowledging a receipt.
pub const RECEIPT: &str = "receipt";
/// Header on `RECEIPT` frames naming the acknowledged receipt.
pub const RECEIPT_ID: &str = "receipt-id";
/// Heart-beat negotiation header (`outgoing,incoming` in milliseconds).
pub const HEART_BEAT: &str = "heart-beat";

/// Error returned by [`decode_frame`] and [`decode_frames`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The command line names no known STOMP command.
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    /// The frame ended before the header block was closed.
    #[error("frame ended inside the header block")]
    Truncated,
    /// The body is not followed by a NUL octet.
    #[error("frame body is missing its NUL terminator")]
    MissingTerminator,
    /// The `content-length` header is not a valid length for this body.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
}

/// STOMP 1.2 frame commands, client and server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Alternate client handshake.
    Stomp,
    /// Server handshake acknowledgement.
    Connected,
    /// Client publish.
    Send,
    /// Client subscription request.
    Subscribe,
    /// Client subscription cancellation.
    Unsubscribe,
    /// Client message acknowledgement.
    Ack,
    /// Client negative acknowledgement.
    Nack,
    /// Transaction start.
    Begin,
    /// Transaction commit.
    Commit,
    /// Transaction abort.
    Abort,
    /// Client graceful shutdown.
    Disconnect,
    /// Server push delivered to a subscription.
    Message,
    /// Server acknowledgement of a `receipt` header.
    Receipt,
    /// Server protocol error; the server closes the connection afterwards.
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Result<Self, CodecError> {
        match raw {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "CONNECTED" => Ok(Self::Connected),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "ACK" => Ok(Self::Ack),
            "NACK" => Ok(Self::Nack),
            "BEGIN" => Ok(Self::Begin),
            "COMMIT" => Ok(Self::Commit),
            "ABORT" => Ok(Self::Abort),
            "DISCONNECT" => Ok(Self::Disconnect),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(CodecError::UnknownCommand(other.to_owned())),
        }
    }

    /// `CONNECT`, `STOMP` and `CONNECTED` frames carry raw header values.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Duplicates are preserved; lookups use the first.
    pub headers: Vec<(String, String)>,
    /// Frame body (JSON text on this channel, often empty).
    pub body: String,
}

impl Frame {
    /// Create an empty frame for `command`.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Client handshake frame for a STOMP 1.2 broker.
    ///
    /// `heart_beat` is `(outgoing_ms, incoming_ms)`; `(0, 0)` disables it.
    #[must_use]
    pub fn connect(host: &str, heart_beat: (u64, u64)) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header(HEART_BEAT, format!("{},{}", heart_beat.0, heart_beat.1))
    }

    /// Subscription request binding `id` to `destination`.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header(ID, id)
            .with_header(DESTINATION, destination)
            .with_header("ack", "auto")
    }

    /// Cancellation of subscription `id`.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header(ID, id)
    }

    /// JSON publish to `destination`.
    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header(DESTINATION, destination)
            .with_header(CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    /// Graceful shutdown, optionally asking for a receipt.
    #[must_use]
    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Self::new(Command::Disconnect);
        match receipt {
            Some(receipt) => frame.with_header(RECEIPT, receipt),
            None => frame,
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Shorthand for the `destination` header.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header(DESTINATION)
    }
}

/// Encode a frame as STOMP text, NUL-terminated.
///
/// A `content-length` header is added for non-empty bodies unless the caller
/// already set one.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        push_header(&mut out, name, value, escape);
    }
    if !frame.body.is_empty() && frame.header(CONTENT_LENGTH).is_none() {
        push_header(&mut out, CONTENT_LENGTH, &frame.body.len().to_string(), false);
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode the first frame of a text message.
///
/// Returns `Ok(None)` for heart-beats (messages holding only end-of-lines).
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first malformed part.
pub fn decode_frame(text: &str) -> Result<Option<Frame>, CodecError> {
    let rest = skip_eols(text);
    if rest.is_empty() {
        return Ok(None);
    }
    parse_one(rest).map(|(frame, _)| Some(frame))
}

/// Decode every frame packed into one text message.
///
/// Heart-beat line feeds between or around frames are skipped.
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first malformed frame. Frames
/// decoded before it are discarded.
pub fn decode_frames(text: &str) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = skip_eols(text);
    while !rest.is_empty() {
        let (frame, tail) = parse_one(rest)?;
        frames.push(frame);
        rest = skip_eols(tail);
    }
    Ok(frames)
}

fn skip_eols(text: &str) -> &str {
    text.trim_start_matches(['\r', '\n'])
}

fn push_header(out: &mut String, name: &str, value: &str, escape: bool) {
    if escape {
        out.push_str(&escape_header(name));
        out.push(':');
        out.push_str(&escape_header(value));
    } else {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
    }
    out.push('\n');
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

/// Split one line off `input`, tolerating `\r\n` line endings.
fn take_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = &input[..idx];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[idx + 1..]))
}

fn parse_one(input: &str) -> Result<(Frame, &str), CodecError> {
    let (command_line, mut rest) = take_line(input).ok_or(CodecError::Truncated)?;
    let command = Command::parse(command_line)?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, tail) = take_line(rest).ok_or(CodecError::Truncated)?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_owned()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == CONTENT_LENGTH)
        .map(|(_, v)| v.as_str());

    let (body, tail) = match content_length {
        Some(raw) => {
            let len = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength(raw.to_owned()))?;
            if len > rest.len() || !rest.is_char_boundary(len) {
                return Err(CodecError::InvalidContentLength(raw.to_owned()));
            }
            let (body, tail) = rest.split_at(len);
            let tail = tail.strip_prefix('\0').ok_or(CodecError::MissingTerminator)?;
            (body, tail)
        }
        None => {
            let idx = rest.find('\0').ok_or(CodecError::MissingTerminator)?;
            (&rest[..idx], &rest[idx + 1..])
        }
    };

    Ok((Frame { command, headers, body: body.to_owned() }, tail))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
