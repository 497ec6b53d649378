//! Envelope routing and the process-wide topic bus.
//!
//! [`route`] is a pure function deciding where a decoded envelope goes.
//! [`TopicBus`] is a typed publish/subscribe channel keyed by [`Topic`];
//! UI-side consumers subscribe to it without knowing about the connection.

use std::fmt;
use std::sync::OnceLock;

use edlink_core::{Envelope, MessageType};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// Default per-subscriber buffer of the global bus.
const GLOBAL_BUS_CAPACITY: usize = 256;

static GLOBAL: OnceLock<TopicBus> = OnceLock::new();

/// Topics published on the bus, one per forwarded message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `connection_success`.
    ConnectionSuccess,
    /// `list_update`.
    ListUpdate,
    /// `prescription_update`.
    PrescriptionUpdate,
    /// `patient_update`.
    PatientUpdate,
    /// `pong`.
    Pong,
    /// `stats`.
    Stats,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Self; 6] = [
        Self::ConnectionSuccess,
        Self::ListUpdate,
        Self::PrescriptionUpdate,
        Self::PatientUpdate,
        Self::Pong,
        Self::Stats,
    ];

    /// The topic for a message type, if that type is forwarded.
    #[must_use]
    pub fn for_message(message_type: MessageType) -> Option<Self> {
        match message_type {
            MessageType::ConnectionSuccess => Some(Self::ConnectionSuccess),
            MessageType::ListUpdate => Some(Self::ListUpdate),
            MessageType::PrescriptionUpdate => Some(Self::PrescriptionUpdate),
            MessageType::PatientUpdate => Some(Self::PatientUpdate),
            MessageType::Pong => Some(Self::Pong),
            MessageType::Stats => Some(Self::Stats),
            MessageType::Notification | MessageType::Alert => None,
        }
    }

    /// The message type this topic carries.
    #[must_use]
    pub fn message_type(self) -> MessageType {
        match self {
            Self::ConnectionSuccess => MessageType::ConnectionSuccess,
            Self::ListUpdate => MessageType::ListUpdate,
            Self::PrescriptionUpdate => MessageType::PrescriptionUpdate,
            Self::PatientUpdate => MessageType::PatientUpdate,
            Self::Pong => MessageType::Pong,
            Self::Stats => MessageType::Stats,
        }
    }

    /// Topic name, identical to the envelope `type`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.message_type().as_str()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an envelope goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Into the notification store.
    Notify,
    /// Onto the topic bus.
    Publish(Topic),
    /// Nowhere; the type is not recognized.
    Ignore,
}

/// Route an envelope by its type.
#[must_use]
pub fn route(envelope: &Envelope) -> Route {
    match envelope.known_type() {
        Some(MessageType::Notification | MessageType::Alert) => Route::Notify,
        Some(t) => Topic::for_message(t).map_or(Route::Ignore, Route::Publish),
        None => Route::Ignore,
    }
}

/// One published event.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicEvent {
    /// The topic.
    pub topic: Topic,
    /// The envelope's `data`.
    pub payload: Value,
}

/// Broadcast bus of [`TopicEvent`]s. Cheap to clone; clones share the
/// channel.
#[derive(Clone, Debug)]
pub struct TopicBus {
    tx: broadcast::Sender<TopicEvent>,
}

impl TopicBus {
    /// A bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Size the process-wide bus. Only the first call before any use of
    /// [`TopicBus::global`] has an effect; returns whether this one did.
    pub fn init_global(capacity: usize) -> bool {
        GLOBAL.set(TopicBus::new(capacity)).is_ok()
    }

    /// The process-wide bus, created with the default capacity unless
    /// [`TopicBus::init_global`] ran first.
    pub fn global() -> &'static TopicBus {
        GLOBAL.get_or_init(|| TopicBus::new(GLOBAL_BUS_CAPACITY))
    }

    /// Publish an event. Never fails; returns how many subscribers got it.
    pub fn publish(&self, topic: Topic, payload: Value) -> usize {
        self.tx.send(TopicEvent { topic, payload }).unwrap_or(0)
    }

    /// Subscribe to one topic.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> TopicSubscription {
        TopicSubscription {
            rx: self.tx.subscribe(),
            filter: Some(topic),
        }
    }

    /// Subscribe to every topic.
    #[must_use]
    pub fn subscribe_all(&self) -> TopicSubscription {
        TopicSubscription {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(GLOBAL_BUS_CAPACITY)
    }
}

/// A subscriber handle. Events published before subscribing are not seen.
#[derive(Debug)]
pub struct TopicSubscription {
    rx: broadcast::Receiver<TopicEvent>,
    filter: Option<Topic>,
}

impl TopicSubscription {
    /// Wait for the next matching event. `None` once the bus is gone.
    /// A lagging subscriber skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "topic subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "topic subscriber lagged");
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }

    fn matches(&self, event: &TopicEvent) -> bool {
        self.filter.is_none_or(|topic| topic == event.topic)
    }
}
