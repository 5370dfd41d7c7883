//! Frame transport between the connection manager and the broker.
//!
//! DESIGN
//! ======
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying STOMP
//! [`Frame`]s out and [`LinkEvent`]s in. The connection manager only ever
//! sees the channels, so tests swap [`WsConnector`] for an in-memory
//! connector without touching session logic.
//!
//! [`WsConnector`] spawns one pump task per link. The pump encodes
//! outbound frames as WebSocket text messages, decodes inbound text into
//! frames (several frames may share one message), and writes a bare EOL
//! heart-beat whenever the configured period elapses. Dropping the
//! outbound sender closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use frames::{CodecError, Frame, decode_frames, encode_frame};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the broker side of a link produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Frame),
    /// Inbound text that is not a valid STOMP frame.
    Malformed { raw: String, error: CodecError },
    /// The link is gone. No further events follow.
    Closed { reason: Option<String> },
}

/// Channel pair for one open transport.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
}

/// Opens transports to a broker URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the endpoint is unreachable
    /// or refuses the upgrade.
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// Production connector: STOMP frames over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    heartbeat: Duration,
}

impl WsConnector {
    /// `heartbeat` of zero disables client heart-beats.
    #[must_use]
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(%url, "transport: websocket open");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, out_rx, in_tx, self.heartbeat));

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}

// =============================================================================
// PUMP
// =============================================================================

async fn pump(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    heartbeat: Duration,
) {
    let mut ticker = (!heartbeat.is_zero()).then(|| interval_at(Instant::now() + heartbeat, heartbeat));

    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    if let Err(e) = ws.close(None).await {
                        debug!(error = %e, "transport: close after sender drop failed");
                    }
                    break None;
                };
                debug!(command = %frame.command, "transport: send frame");
                if let Err(e) = ws.send(Message::Text(encode_frame(&frame).into())).await {
                    break Some(e.to_string());
                }
            }
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(close))) => break close.map(|c| c.reason.as_str().to_owned()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                };
                if !forward(&inbound, &text) {
                    return;
                }
            }
            () = next_beat(&mut ticker) => {
                if let Err(e) = ws.send(Message::Text("\n".into())).await {
                    break Some(e.to_string());
                }
            }
        }
    };

    info!(reason = reason.as_deref().unwrap_or("-"), "transport: websocket closed");
    if inbound.send(LinkEvent::Closed { reason }).is_err() {
        debug!("transport: close event had no receiver");
    }
}

/// Decode `text` and push the result upstream. Returns `false` once the
/// receiving side is gone.
fn forward(inbound: &mpsc::UnboundedSender<LinkEvent>, text: &str) -> bool {
    let events = match decode_frames(text) {
        Ok(frames) => frames.into_iter().map(LinkEvent::Frame).collect(),
        Err(error) => {
            warn!(%error, raw = %text, "transport: malformed inbound frame");
            vec![LinkEvent::Malformed { raw: text.to_owned(), error }]
        }
    };
    events.into_iter().all(|event| inbound.send(event).is_ok())
}

async fn next_beat(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "transport_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
