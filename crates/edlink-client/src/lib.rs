//! # edlink-client
//!
//! Realtime connection manager for the emergency-department dashboard.
//!
//! [`RealtimeManager`] owns one long-lived, authenticated WebSocket
//! connection to the realtime server and is the only type callers need:
//!
//! - **Session**: [`SessionMachine`] is the sans-IO connection state
//!   machine (`Disconnected → Connecting → Connected → Reconnecting →
//!   GivenUp`); a single driver task feeds it transport, heartbeat and
//!   retry events in order.
//! - **Liveness**: [`HeartbeatScheduler`] emits `ping` frames while
//!   connected; [`ReconnectPolicy`] bounds automatic reconnection.
//! - **Routing**: `notification`/`alert` envelopes land in the
//!   [`NotificationStore`]; list, prescription, patient, stats, pong and
//!   connection-success envelopes are published on the [`TopicBus`].
//! - **Seams**: [`IdentityProvider`] supplies user and token,
//!   [`Connector`] opens the transport ([`TungsteniteConnector`] in
//!   production, [`testing::ChannelConnector`] in tests), and an optional
//!   [`Notifier`] surfaces new notifications natively.

#![deny(unsafe_code)]

pub mod close;
pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod identity;
pub mod manager;
pub mod notifications;
pub mod notifier;
pub mod reconnect;
pub mod session;
pub mod testing;
pub mod transport;

pub use close::CloseCode;
pub use config::ClientConfig;
pub use dispatch::{Route, Topic, TopicBus, TopicEvent, TopicSubscription, route};
pub use heartbeat::HeartbeatScheduler;
pub use identity::{
    AuthToken, ConnectionTarget, IdentityContext, IdentityProvider, MemoryIdentity, TargetError,
    UserIdentity,
};
pub use manager::{RealtimeManager, RealtimeManagerBuilder};
pub use notifications::{NotificationItem, NotificationStore, Priority};
pub use notifier::Notifier;
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use session::{Action, AttemptId, ConnectionState, SessionEvent, SessionMachine};
pub use transport::{
    Connection, Connector, InboundFrame, OutboundFrame, TransportError, TungsteniteConnector,
};
