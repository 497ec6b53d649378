//! Transport seam and the tokio-tungstenite implementation.
//!
//! A [`Connector`] turns a [`ConnectionTarget`] into a [`Connection`]: a pair
//! of channels to a live socket. Frames the manager wants sent go into
//! `outbound`; frames and the final close come out of `inbound`. Dropping
//! the `outbound` sender closes the socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tracing::{debug, info};

use crate::close::CloseCode;
use crate::identity::ConnectionTarget;

/// Why a connection could not be opened.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket handshake or underlying socket failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    /// The connection was refused before a socket existed.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The handshake did not complete in time.
    #[error("handshake timed out after {}ms", .0.as_millis())]
    TimedOut(std::time::Duration),
}

/// Frame from the manager to the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text frame.
    Text(String),
    /// Send a close frame and stop writing.
    Close {
        /// Close code.
        code: CloseCode,
        /// Close reason.
        reason: String,
    },
}

/// Frame from the socket to the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame (or a UTF-8 binary frame).
    Text(String),
    /// The socket closed. Always the last frame.
    Closed {
        /// Close code; [`CloseCode::ABNORMAL`] for errors and
        /// [`CloseCode::NO_STATUS`] for a close frame without one.
        code: CloseCode,
        /// Close reason or error text.
        reason: String,
    },
}

/// An open connection.
#[derive(Debug)]
pub struct Connection {
    /// Frames to write.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Frames read, ending with [`InboundFrame::Closed`].
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `target`.
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct TungsteniteConnector {
    queue_capacity: usize,
}

impl TungsteniteConnector {
    /// Connector whose per-connection channels hold `queue_capacity` frames.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
        }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(target.as_str())
            .await
            .map_err(Box::new)?;
        info!(url = %target, "websocket open");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(self.queue_capacity);
        let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(self.queue_capacity);

        // Writer: drains outbound until a close is requested or the manager
        // drops its sender.
        drop(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: WsCloseCode::from(code.as_u16()),
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = ws_tx.close().await;
        }));

        // Reader: forwards text until the socket closes, then reports why.
        drop(tokio::spawn(async move {
            let (code, reason) = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(InboundFrame::Text(text.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if in_tx.send(InboundFrame::Text(text.to_owned())).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!(len = data.len(), "dropping non-UTF8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || (CloseCode::NO_STATUS, String::new()),
                            |f| (CloseCode::from(u16::from(f.code)), f.reason.to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break (CloseCode::ABNORMAL, e.to_string()),
                    None => break (CloseCode::ABNORMAL, "stream ended".to_owned()),
                }
            };
            let _ = in_tx.send(InboundFrame::Closed { code, reason }).await;
        }));

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
