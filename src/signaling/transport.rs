//! WebSocket transport for the signaling channel
//!
//! Owns the socket through two spawned tasks: a sender task draining an
//! unbounded outbound queue, and a receiver task decoding inbound frames and
//! forwarding [`TransportEvent`]s. Send never blocks the caller; closure of
//! the socket for any reason surfaces as a terminal `Closed` event.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events surfaced by the receiver task
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded signaling frame
    Frame(ServerMessage),
    /// A frame that failed to decode (unknown tag or malformed payload)
    Invalid(Error),
    /// The socket closed; no further events follow
    Closed(Option<String>),
}

/// Handle to an open signaling channel
pub struct SignalingTransport {
    outbound: mpsc::UnboundedSender<Message>,
}

impl SignalingTransport {
    /// Open the channel, bounded by `deadline` for the TCP + WebSocket
    /// handshake. Returns the transport and the inbound event stream.
    pub async fn open(
        url: &Url,
        deadline: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        debug!(host = ?url.host_str(), "opening signaling channel");

        let (ws, _response) = tokio::time::timeout(deadline, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Timeout("signaling channel open".to_string()))?
            .map_err(|e| Error::WebSocketError(e.to_string()))?;

        let (write, read) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender_task(write, outbound_rx));
        tokio::spawn(receiver_task(read, event_tx));

        Ok((Self { outbound }, event_rx))
    }

    /// Queue a message for sending; never blocks
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| Error::SignalingClosed("signaling channel closed".to_string()))
    }

    /// Request a clean close; best-effort if the socket is already gone
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("signaling send failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
    debug!("signaling sender task stopped");
}

async fn receiver_task(
    mut read: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut close_reason = None;
    while let Some(item) = read.next().await {
        match item {
            Ok(Message::Text(text)) => {
                let event = match ServerMessage::parse(&text) {
                    Ok(msg) => TransportEvent::Frame(msg),
                    Err(e) => {
                        warn!("undecodable signaling frame: {}", e);
                        TransportEvent::Invalid(e)
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                close_reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Ok(_) => {} // ping/pong handled by tungstenite, binary ignored
            Err(e) => {
                close_reason = Some(e.to_string());
                break;
            }
        }
    }
    debug!(reason = ?close_reason, "signaling channel closed");
    let _ = events.send(TransportEvent::Closed(close_reason));
}
