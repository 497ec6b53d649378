//! In-memory transport for tests.
//!
//! [`ChannelConnector`] hands every connection's far end to the test as a
//! [`ServerEnd`], so a test plays the server: it pushes envelopes, reads what
//! the client sent and closes with any code.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use edlink_core::{Envelope, MessageType, encode};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::close::CloseCode;
use crate::identity::ConnectionTarget;
use crate::transport::{Connection, Connector, InboundFrame, OutboundFrame, TransportError};

/// [`Connector`] whose connections are channel pairs.
#[derive(Debug)]
pub struct ChannelConnector {
    ends: mpsc::UnboundedSender<ServerEnd>,
    failures: Mutex<u32>,
    stalls: Mutex<u32>,
    attempts: AtomicUsize,
    capacity: usize,
}

impl ChannelConnector {
    /// A connector and the stream of server ends it produces.
    #[must_use]
    pub fn new() -> (Arc<Self>, ServerEnds) {
        Self::with_capacity(64)
    }

    /// Like [`ChannelConnector::new`], with `capacity` frames of buffering in
    /// each direction.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, ServerEnds) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            ends: tx,
            failures: Mutex::new(0),
            stalls: Mutex::new(0),
            attempts: AtomicUsize::new(0),
            capacity,
        });
        (connector, ServerEnds { rx })
    }

    /// Make the next `n` connects fail.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    /// Make the next `n` connects hang forever, like a server that accepts
    /// the socket and never answers the handshake.
    pub fn stall_next(&self, n: u32) {
        *self.stalls.lock() = n;
    }

    /// Connects attempted so far, failed ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Refused("scripted failure".into()));
            }
        }
        let stalled = {
            let mut stalls = self.stalls.lock();
            let stalled = *stalls > 0;
            if stalled {
                *stalls -= 1;
            }
            stalled
        };
        if stalled {
            return std::future::pending().await;
        }

        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let (in_tx, in_rx) = mpsc::channel(self.capacity);
        let end = ServerEnd {
            target: target.clone(),
            to_client: in_tx,
            from_client: out_rx,
        };
        if self.ends.send(end).is_err() {
            return Err(TransportError::Refused("test dropped its server ends".into()));
        }
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Stream of [`ServerEnd`]s, one per successful connect.
#[derive(Debug)]
pub struct ServerEnds {
    rx: mpsc::UnboundedReceiver<ServerEnd>,
}

impl ServerEnds {
    /// Wait for the next connection.
    pub async fn next(&mut self) -> Option<ServerEnd> {
        self.rx.recv().await
    }

    /// The next connection, if one is already waiting.
    pub fn try_next(&mut self) -> Option<ServerEnd> {
        self.rx.try_recv().ok()
    }
}

/// The server side of one in-memory connection.
#[derive(Debug)]
pub struct ServerEnd {
    /// Where the client connected.
    pub target: ConnectionTarget,
    to_client: mpsc::Sender<InboundFrame>,
    from_client: mpsc::Receiver<OutboundFrame>,
}

impl ServerEnd {
    /// Push a raw text frame.
    pub async fn send_raw(&self, raw: impl Into<String>) -> bool {
        self.to_client.send(InboundFrame::Text(raw.into())).await.is_ok()
    }

    /// Push an envelope stamped with the current time.
    pub async fn send_envelope(&self, message_type: MessageType, data: Value) -> bool {
        self.send_raw(encode(&Envelope::new(message_type, data))).await
    }

    /// Close the connection from the server side.
    pub async fn close(&self, code: CloseCode, reason: &str) -> bool {
        self.to_client
            .send(InboundFrame::Closed {
                code,
                reason: reason.to_owned(),
            })
            .await
            .is_ok()
    }

    /// Next frame the client sent; `None` once the client dropped the
    /// connection.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Next frame the client sent, if one is already waiting.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.try_recv().ok()
    }
}
