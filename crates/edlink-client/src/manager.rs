//! Connection manager facade and its driver task.
//!
//! [`RealtimeManager`] is the only type UI code talks to. Starting one spawns
//! a driver task that exclusively owns the [`SessionMachine`] and processes
//! one event at a time from a single queue: transport open/frame/close,
//! heartbeat ticks and retry timers all arrive there, tagged with the
//! [`AttemptId`] that produced them.
//!
//! Timers and transport readers are spawned with child tokens of the
//! manager's [`CancellationToken`]. Dropping or shutting down the manager
//! cancels the root token, which synchronously disarms every one of them,
//! and closes the live transport with [`CloseCode::NORMAL`].
//!
//! The facade reads snapshots the driver publishes: connection state via a
//! `watch` channel, counters and stats behind short-lived locks. The
//! notification store is shared so that `mark_notification_as_read` and
//! `clear_notifications` take effect before they return.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use edlink_core::{ClientFrame, Envelope, MessageType, NotificationId};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::close::CloseCode;
use crate::config::ClientConfig;
use crate::dispatch::{Route, Topic, TopicBus, route};
use crate::heartbeat::run_heartbeat;
use crate::identity::{ConnectionTarget, IdentityContext, IdentityProvider};
use crate::notifications::{NotificationItem, NotificationStore};
use crate::notifier::Notifier;
use crate::session::{Action, AttemptId, ConnectionState, SessionEvent, SessionMachine};
use crate::transport::{
    Connection, Connector, InboundFrame, OutboundFrame, TransportError, TungsteniteConnector,
};

/// Configures and starts a [`RealtimeManager`].
pub struct RealtimeManagerBuilder {
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Option<Arc<dyn Connector>>,
    bus: Option<TopicBus>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RealtimeManagerBuilder {
    /// Use a custom transport. Defaults to [`TungsteniteConnector`].
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Publish on `bus`. Defaults to [`TopicBus::global`].
    #[must_use]
    pub fn bus(mut self, bus: TopicBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Surface new notifications through `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Spawn the driver and, if an identity is available, start connecting.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(self) -> RealtimeManager {
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(TungsteniteConnector::new(self.config.send_queue_capacity))
        });
        let bus = self.bus.unwrap_or_else(|| TopicBus::global().clone());

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state: state_tx,
            store: Mutex::new(NotificationStore::new()),
            stats: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            last_ping_sent_at: Mutex::new(None),
            outbound: Mutex::new(None),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            machine: SessionMachine::new(self.config.reconnect_policy(), self.config.pong_timeout),
            shared: shared.clone(),
            config: self.config,
            identity: self.identity,
            connector,
            bus,
            notifier: self.notifier,
            events: events_tx.clone(),
            cancel: cancel.clone(),
            heartbeat: None,
            retry: None,
            link: None,
        };
        let span = info_span!("realtime", user_id = tracing::field::Empty);
        let handle = tokio::spawn(driver.run(events_rx).instrument(span));

        RealtimeManager {
            shared,
            events: events_tx,
            cancel,
            driver: Some(handle),
        }
    }
}

/// Realtime connection manager. See the module docs.
///
/// Dropping the manager tears the connection down intentionally: no
/// heartbeat, retry or reconnect survives it.
pub struct RealtimeManager {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<DriverEvent>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl RealtimeManager {
    /// Builder with the default transport and the global topic bus.
    #[must_use]
    pub fn builder(config: ClientConfig, identity: Arc<dyn IdentityProvider>) -> RealtimeManagerBuilder {
        RealtimeManagerBuilder {
            config,
            identity,
            connector: None,
            bus: None,
            notifier: None,
        }
    }

    /// Start with the default transport and the global topic bus.
    #[must_use]
    pub fn start(config: ClientConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::builder(config, identity).start()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Snapshot of the notifications, newest first.
    #[must_use]
    pub fn notifications(&self) -> Vec<NotificationItem> {
        self.shared.store.lock().items()
    }

    /// Number of unread notifications.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.shared.store.lock().unread_count()
    }

    /// Mark one notification read. Unknown or already-read ids are a no-op.
    pub fn mark_notification_as_read(&self, id: &NotificationId) -> bool {
        self.shared.store.lock().mark_read(id)
    }

    /// Drop every notification.
    pub fn clear_notifications(&self) {
        self.shared.store.lock().clear_all();
    }

    /// Last stats reported by the server (`connection_success` or `stats`).
    #[must_use]
    pub fn connection_stats(&self) -> Option<Value> {
        self.shared.stats.lock().clone()
    }

    /// Retries scheduled since the last successful connection.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// When the last `ping` went out.
    #[must_use]
    pub fn last_ping_sent_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_ping_sent_at.lock()
    }

    /// Serialize `message` as JSON and send it. Returns `false` (and logs a
    /// warning) when not connected; nothing is queued for later.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(error) => {
                warn!(%error, "message is not serializable, not sent");
                false
            }
        }
    }

    /// Ask the server for a `stats` envelope.
    pub fn request_stats(&self) -> bool {
        self.send_text(ClientFrame::GetStats.to_json())
    }

    /// Re-poll the identity provider and connect if idle. Use after the user
    /// logs in, or to recover from [`ConnectionState::GivenUp`].
    pub fn reinitialize(&self) {
        if self.events.send(DriverEvent::Reinitialize).is_err() {
            debug!("driver stopped, reinitialize ignored");
        }
    }

    /// Close intentionally and wait for the driver to finish.
    pub async fn shutdown(mut self) {
        self.teardown();
        if let Some(driver) = self.driver.take() {
            if let Err(error) = driver.await {
                warn!(%error, "realtime driver task failed");
            }
        }
    }

    fn send_text(&self, text: String) -> bool {
        let outbound = if self.is_connected() {
            self.shared.outbound.lock().clone()
        } else {
            None
        };
        let Some(tx) = outbound else {
            warn!(state = %self.state(), len = text.len(), "not connected, message not sent");
            return false;
        };
        match tx.try_send(OutboundFrame::Text(text)) {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "outbound queue unavailable, message not sent");
                false
            }
        }
    }

    fn teardown(&self) {
        self.shared.close_intentionally();
        self.cancel.cancel();
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// State the driver publishes for the facade.
struct Shared {
    state: watch::Sender<ConnectionState>,
    store: Mutex<NotificationStore>,
    stats: Mutex<Option<Value>>,
    reconnect_attempts: AtomicU32,
    last_ping_sent_at: Mutex<Option<DateTime<Utc>>>,
    /// Present only while connected.
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
}

impl Shared {
    fn close_intentionally(&self) {
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.try_send(OutboundFrame::Close {
                code: CloseCode::NORMAL,
                reason: "client shutdown".into(),
            });
        }
    }
}

enum DriverEvent {
    Session(AttemptId, SessionEvent),
    Opened(AttemptId, Connection),
    Reinitialize,
}

struct Driver {
    machine: SessionMachine,
    shared: Arc<Shared>,
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn Connector>,
    bus: TopicBus,
    notifier: Option<Arc<dyn Notifier>>,
    events: mpsc::UnboundedSender<DriverEvent>,
    cancel: CancellationToken,
    heartbeat: Option<CancellationToken>,
    retry: Option<CancellationToken>,
    /// Connect task, then reader task, of the current attempt.
    link: Option<CancellationToken>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
        self.connect_from_identity();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
        let actions = self.machine.shutdown();
        self.apply(actions);
        cancel_slot(&mut self.link);
        info!("realtime driver stopped");
    }

    fn on_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Session(attempt, event) => {
                let actions = self.machine.handle(attempt, event);
                self.apply(actions);
            }
            DriverEvent::Opened(attempt, connection) => self.on_opened(attempt, connection),
            DriverEvent::Reinitialize => self.connect_from_identity(),
        }
    }

    fn connect_from_identity(&mut self) {
        let state = self.machine.state();
        if !state.is_idle() {
            debug!(%state, "connection already active");
            return;
        }
        let Some(identity) = IdentityContext::resolve(self.identity.as_ref(), &self.config) else {
            debug!("no user or token available, not connecting");
            return;
        };
        let _ = tracing::Span::current().record("user_id", identity.user_id.as_str());
        match ConnectionTarget::build(&self.config, &identity) {
            Ok(target) => {
                let actions = self.machine.connect(target);
                self.apply(actions);
            }
            Err(error) => warn!(%error, "cannot build connection target"),
        }
    }

    fn on_opened(&mut self, attempt: AttemptId, connection: Connection) {
        let actions = self.machine.handle(attempt, SessionEvent::Opened);
        if self.machine.state() == ConnectionState::Connected
            && self.machine.current_attempt() == attempt
        {
            let Connection { outbound, inbound } = connection;
            *self.shared.outbound.lock() = Some(outbound);
            self.spawn_reader(attempt, inbound);
        } else {
            // Dropping the connection closes it.
            debug!(%attempt, "discarding connection opened for a stale attempt");
        }
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Open { attempt, target } => self.open(attempt, target),
                Action::Send(text) => {
                    if self.send_frame(text) {
                        self.machine.ping_sent();
                    }
                }
                Action::Close { code, reason } => {
                    if let Some(tx) = self.shared.outbound.lock().take() {
                        if tx.try_send(OutboundFrame::Close { code, reason }).is_err() {
                            debug!(%code, "transport gone before close frame");
                        }
                    }
                }
                Action::StartHeartbeat { attempt } => self.start_heartbeat(attempt),
                Action::StopHeartbeat => cancel_slot(&mut self.heartbeat),
                Action::ScheduleRetry { attempt, delay } => self.schedule_retry(attempt, delay),
                Action::CancelRetry => cancel_slot(&mut self.retry),
                Action::Deliver(envelope) => self.deliver(envelope),
            }
        }
        self.publish_snapshot();
    }

    fn open(&mut self, attempt: AttemptId, target: ConnectionTarget) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.link.replace(token.clone()) {
            previous.cancel();
        }
        info!(%attempt, url = %target, "connecting");

        let connector = self.connector.clone();
        let events = self.events.clone();
        let deadline = self.config.connect_timeout;
        drop(tokio::spawn(
            async move {
                let result = tokio::select! {
                    () = token.cancelled() => return,
                    result = tokio::time::timeout(deadline, connector.connect(&target)) => {
                        result.unwrap_or_else(|_| Err(TransportError::TimedOut(deadline)))
                    }
                };
                let event = match result {
                    Ok(connection) => DriverEvent::Opened(attempt, connection),
                    Err(error) => {
                        warn!(%attempt, %error, "connection attempt failed");
                        DriverEvent::Session(
                            attempt,
                            SessionEvent::Closed {
                                code: CloseCode::ABNORMAL,
                                reason: error.to_string(),
                            },
                        )
                    }
                };
                let _ = events.send(event);
            }
            .in_current_span(),
        ));
    }

    fn spawn_reader(&self, attempt: AttemptId, mut inbound: mpsc::Receiver<InboundFrame>) {
        let token = self
            .link
            .clone()
            .unwrap_or_else(|| self.cancel.child_token());
        let events = self.events.clone();
        drop(tokio::spawn(
            async move {
                loop {
                    let frame = tokio::select! {
                        () = token.cancelled() => break,
                        frame = inbound.recv() => frame,
                    };
                    let event = match frame {
                        Some(InboundFrame::Text(text)) => SessionEvent::Frame(text),
                        Some(InboundFrame::Closed { code, reason }) => {
                            SessionEvent::Closed { code, reason }
                        }
                        None => SessionEvent::Closed {
                            code: CloseCode::ABNORMAL,
                            reason: "transport dropped".into(),
                        },
                    };
                    let last = matches!(event, SessionEvent::Closed { .. });
                    if events.send(DriverEvent::Session(attempt, event)).is_err() || last {
                        break;
                    }
                }
            }
            .in_current_span(),
        ));
    }

    fn send_frame(&self, text: String) -> bool {
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(OutboundFrame::Text(text)) {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "heartbeat frame not sent");
                false
            }
        }
    }

    fn start_heartbeat(&mut self, attempt: AttemptId) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.heartbeat.replace(token.clone()) {
            previous.cancel();
        }
        let events = self.events.clone();
        let tick = move || {
            events
                .send(DriverEvent::Session(attempt, SessionEvent::HeartbeatDue))
                .is_ok()
        };
        drop(tokio::spawn(
            run_heartbeat(self.config.heartbeat_interval, token, tick).in_current_span(),
        ));
    }

    fn schedule_retry(&mut self, attempt: AttemptId, delay: Duration) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.retry.replace(token.clone()) {
            previous.cancel();
        }
        let events = self.events.clone();
        drop(tokio::spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(delay) => {
                        let _ = events.send(DriverEvent::Session(attempt, SessionEvent::RetryDue));
                    }
                }
            }
            .in_current_span(),
        ));
    }

    fn deliver(&self, envelope: Envelope) {
        match route(&envelope) {
            Route::Notify => {
                let Some(item) = self.shared.store.lock().add_from_envelope(&envelope) else {
                    return;
                };
                info!(kind = %item.kind, priority = item.priority.as_str(), "notification received");
                if envelope.is(MessageType::Notification) {
                    if let Some(notifier) = &self.notifier {
                        notifier.notify(&item);
                    }
                }
            }
            Route::Publish(topic) => {
                match topic {
                    Topic::ConnectionSuccess => {
                        *self.shared.stats.lock() = envelope.data.get("stats").cloned();
                    }
                    Topic::Stats => *self.shared.stats.lock() = Some(envelope.data.clone()),
                    _ => {}
                }
                let receivers = self.bus.publish(topic, envelope.data);
                debug!(%topic, receivers, "published");
            }
            Route::Ignore => {
                debug!(
                    message_type = envelope.message_type.as_str(),
                    "ignoring unrecognized message type"
                );
            }
        }
    }

    fn publish_snapshot(&self) {
        let state = self.machine.state();
        if state != ConnectionState::Connected {
            drop(self.shared.outbound.lock().take());
        }
        self.shared
            .reconnect_attempts
            .store(self.machine.reconnect_attempts(), Ordering::Relaxed);
        *self.shared.last_ping_sent_at.lock() = self.machine.last_ping_sent_at();

        let changed = self.shared.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(%state, reconnect_attempts = self.machine.reconnect_attempts(), "connection state changed");
        }
    }
}

fn cancel_slot(slot: &mut Option<CancellationToken>) {
    if let Some(token) = slot.take() {
        token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use edlink_core::logging::capture_logs;
    use serde_json::json;
    use tokio::time::{Instant, sleep, timeout};
    use tracing::Level;

    use super::*;
    use crate::identity::{AuthToken, MemoryIdentity, UserIdentity};
    use crate::notifications::Priority;
    use crate::testing::{ChannelConnector, ServerEnd, ServerEnds};

    struct Fixture {
        manager: RealtimeManager,
        connector: Arc<ChannelConnector>,
        ends: ServerEnds,
        bus: TopicBus,
        identity: Arc<MemoryIdentity>,
    }

    fn fixture_with(config: ClientConfig, identity: MemoryIdentity) -> Fixture {
        fixture_on(ChannelConnector::new(), config, identity)
    }

    fn fixture_on(
        (connector, ends): (Arc<ChannelConnector>, ServerEnds),
        config: ClientConfig,
        identity: MemoryIdentity,
    ) -> Fixture {
        let bus = TopicBus::new(16);
        let identity = Arc::new(identity);
        let manager = RealtimeManager::builder(config, identity.clone())
            .connector(connector.clone())
            .bus(bus.clone())
            .start();
        Fixture {
            manager,
            connector,
            ends,
            bus,
            identity,
        }
    }

    fn fixture(config: ClientConfig) -> Fixture {
        fixture_with(
            config,
            MemoryIdentity::new(UserIdentity::new("u1"), AuthToken::new("tok")),
        )
    }

    async fn wait_for(manager: &RealtimeManager, state: ConnectionState) {
        let mut rx = manager.watch_state();
        let _ = timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}"))
            .unwrap();
    }

    /// Let every ready task run without letting timers fire.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    async fn connect(f: &mut Fixture) -> ServerEnd {
        let end = f.ends.next().await.unwrap();
        wait_for(&f.manager, ConnectionState::Connected).await;
        end
    }

    #[tokio::test(start_paused = true)]
    async fn no_identity_means_no_connection() {
        let f = fixture_with(ClientConfig::default(), MemoryIdentity::anonymous());
        sleep(Duration::from_secs(60)).await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert_eq!(f.connector.connect_count(), 0);
        assert!(!f.manager.send(&json!({"type": "hello"})));
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_identity_in_target() {
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;
        assert!(f.manager.is_connected());
        assert_eq!(end.target.url().path(), "/realtime/ws/u1");
        assert_eq!(end.target.url().query(), Some("role=enfermera&area=emergencia&token=tok"));
        assert_eq!(f.manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn notification_lands_in_store() {
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;
        assert!(
            end.send_raw(
                r#"{"type":"notification","data":{"message":"Bed 3 critical","priority":"high"},"timestamp":"2024-01-01T00:00:00Z"}"#
            )
            .await
        );
        settle().await;

        let items = f.manager.notifications();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].message, "Bed 3 critical");
        assert_eq!(items[0].priority, Priority::High);
        assert!(!items[0].read);
        assert_eq!(f.manager.unread_count(), 1);

        assert!(f.manager.mark_notification_as_read(&items[0].id));
        assert!(!f.manager.mark_notification_as_read(&items[0].id));
        assert_eq!(f.manager.unread_count(), 0);

        f.manager.clear_notifications();
        assert!(f.manager.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn list_update_is_published_not_stored() {
        let mut f = fixture(ClientConfig::default());
        let mut lists = f.bus.subscribe(Topic::ListUpdate);
        let end = connect(&mut f).await;

        assert!(end.send_envelope(MessageType::ListUpdate, json!({"episodeId": "E1"})).await);
        let event = timeout(Duration::from_secs(1), lists.recv()).await.unwrap().unwrap();
        assert_eq!(event.topic, Topic::ListUpdate);
        assert_eq!(event.payload, json!({"episodeId": "E1"}));
        assert!(f.manager.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_type_is_ignored() {
        let mut f = fixture(ClientConfig::default());
        let mut all = f.bus.subscribe_all();
        let end = connect(&mut f).await;
        assert!(
            end.send_raw(r#"{"type":"bed_swap","data":{},"timestamp":"2024-01-01T00:00:00Z"}"#)
                .await
        );
        settle().await;
        assert!(all.try_recv().is_none());
        assert!(f.manager.notifications().is_empty());
        assert!(f.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_fires_for_notifications_only() {
        let (connector, mut ends) = ChannelConnector::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let manager = RealtimeManager::builder(
            ClientConfig::default(),
            Arc::new(MemoryIdentity::new(UserIdentity::new("u1"), AuthToken::new("tok"))),
        )
        .connector(connector)
        .bus(TopicBus::new(4))
        .notifier(Arc::new(move |_: &NotificationItem| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }))
        .start();

        let end = ends.next().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        assert!(end.send_envelope(MessageType::Notification, json!({"message": "n"})).await);
        assert!(end.send_envelope(MessageType::Alert, json!({"message": "a"})).await);
        settle().await;

        assert_eq!(manager.notifications().len(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_cached_and_requestable() {
        let mut f = fixture(ClientConfig::default());
        let mut success = f.bus.subscribe(Topic::ConnectionSuccess);
        let mut end = connect(&mut f).await;
        assert!(f.manager.connection_stats().is_none());

        assert!(
            end.send_envelope(
                MessageType::ConnectionSuccess,
                json!({"stats": {"total_users": 3}})
            )
            .await
        );
        settle().await;
        assert_eq!(f.manager.connection_stats(), Some(json!({"total_users": 3})));
        assert!(success.try_recv().is_some());

        assert!(f.manager.request_stats());
        assert_eq!(
            end.recv().await,
            Some(OutboundFrame::Text(r#"{"type":"get_stats"}"#.into()))
        );
        assert!(end.send_envelope(MessageType::Stats, json!({"total_users": 4})).await);
        settle().await;
        assert_eq!(f.manager.connection_stats(), Some(json!({"total_users": 4})));
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_connected_reaches_server() {
        let mut f = fixture(ClientConfig::default());
        let mut end = connect(&mut f).await;
        assert!(f.manager.send(&json!({"type": "ack", "id": 1})));
        assert_eq!(
            end.recv().await,
            Some(OutboundFrame::Text(r#"{"id":1,"type":"ack"}"#.into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_every_interval() {
        let mut f = fixture(ClientConfig::default());
        let mut end = connect(&mut f).await;
        assert!(f.manager.last_ping_sent_at().is_none());

        let started = Instant::now();
        assert_eq!(end.recv().await, Some(OutboundFrame::Text(r#"{"type":"ping"}"#.into())));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(end.recv().await, Some(OutboundFrame::Text(r#"{"type":"ping"}"#.into())));
        assert!(started.elapsed() >= Duration::from_secs(60));
        settle().await;
        assert!(f.manager.last_ping_sent_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_dropped_by_full_queue_is_not_recorded() {
        let (logs, _guard) = capture_logs();
        let mut f = fixture_on(
            ChannelConnector::with_capacity(1),
            ClientConfig::default(),
            MemoryIdentity::new(UserIdentity::new("u1"), AuthToken::new("tok")),
        );
        let mut end = connect(&mut f).await;
        assert!(f.manager.send(&json!({"type": "hello"})));

        sleep(Duration::from_secs(31)).await;
        assert!(logs.has_event(Level::WARN, "heartbeat frame not sent"));
        assert!(f.manager.last_ping_sent_at().is_none());
        assert!(f.manager.is_connected());

        assert_eq!(end.recv().await, Some(OutboundFrame::Text(r#"{"type":"hello"}"#.into())));
        sleep(Duration::from_secs(30)).await;
        settle().await;
        assert!(f.manager.last_ping_sent_at().is_some());
        assert_eq!(end.try_recv(), Some(OutboundFrame::Text(r#"{"type":"ping"}"#.into())));
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_keeps_connection() {
        let (logs, _guard) = capture_logs();
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;

        assert!(end.send_raw("garbage").await);
        assert!(end.send_envelope(MessageType::Notification, json!({"message": "ok"})).await);
        settle().await;

        assert!(logs.has_event(Level::WARN, "discarding undecodable frame"));
        assert!(f.manager.is_connected());
        assert_eq!(f.manager.notifications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_disconnects_without_retry() {
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;
        assert!(end.close(CloseCode::NORMAL, "bye").await);
        wait_for(&f.manager, ConnectionState::Disconnected).await;

        sleep(Duration::from_secs(120)).await;
        assert!(!f.manager.is_connected());
        assert_eq!(f.connector.connect_count(), 1);
        assert!(!f.manager.send(&json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_after_delay() {
        let mut f = fixture(ClientConfig::default());
        let first = connect(&mut f).await;
        assert!(first.close(CloseCode::ABNORMAL, "").await);
        wait_for(&f.manager, ConnectionState::Reconnecting).await;
        assert_eq!(f.manager.reconnect_attempts(), 1);
        assert!(!f.manager.request_stats());

        let lost_at = Instant::now();
        let _second = f.ends.next().await.unwrap();
        assert!(lost_at.elapsed() >= Duration::from_secs(5));
        wait_for(&f.manager, ConnectionState::Connected).await;
        assert_eq!(f.manager.reconnect_attempts(), 0);
        assert_eq!(f.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let config = ClientConfig {
            max_reconnect_attempts: 2,
            ..ClientConfig::default()
        };
        let mut f = fixture(config);
        let end = connect(&mut f).await;

        // The drop is close 1 and schedules the only retry; its failure is
        // close 2 and reaches the ceiling.
        f.connector.fail_next(10);
        assert!(end.close(CloseCode::ABNORMAL, "").await);
        wait_for(&f.manager, ConnectionState::GivenUp).await;
        assert_eq!(f.connector.connect_count(), 2);
        assert_eq!(f.manager.reconnect_attempts(), 2);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(f.connector.connect_count(), 2);
        assert_eq!(f.manager.state(), ConnectionState::GivenUp);
    }

    #[tokio::test(start_paused = true)]
    async fn default_ceiling_gives_up_on_fifth_close() {
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;
        f.connector.fail_next(10);
        assert!(end.close(CloseCode::ABNORMAL, "").await);
        wait_for(&f.manager, ConnectionState::GivenUp).await;
        assert_eq!(f.connector.connect_count(), 5);
        assert_eq!(f.manager.reconnect_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_counts_as_abnormal_close() {
        let (logs, _guard) = capture_logs();
        let mut f = fixture(ClientConfig::default());
        let first = connect(&mut f).await;
        f.connector.stall_next(1);

        let lost_at = Instant::now();
        assert!(first.close(CloseCode::ABNORMAL, "").await);
        wait_for(&f.manager, ConnectionState::Reconnecting).await;
        assert_eq!(f.manager.reconnect_attempts(), 1);

        // Retry at 5s stalls, times out at 15s and schedules retry 2.
        sleep(Duration::from_secs(16)).await;
        assert_eq!(f.connector.connect_count(), 2);
        assert_eq!(f.manager.reconnect_attempts(), 2);
        assert_eq!(f.manager.state(), ConnectionState::Reconnecting);
        assert!(logs.has_event(Level::WARN, "connection attempt failed"));

        let _third = f.ends.next().await.unwrap();
        assert!(lost_at.elapsed() >= Duration::from_secs(20));
        wait_for(&f.manager, ConnectionState::Connected).await;
        assert_eq!(f.connector.connect_count(), 3);
        assert_eq!(f.manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshakes_exhaust_the_ceiling() {
        let config = ClientConfig {
            max_reconnect_attempts: 2,
            connect_timeout: Duration::from_secs(1),
            ..ClientConfig::default()
        };
        let f = fixture(config);
        f.connector.stall_next(10);
        wait_for(&f.manager, ConnectionState::GivenUp).await;
        assert_eq!(f.connector.connect_count(), 2);
        assert_eq!(f.manager.reconnect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialize_recovers_from_given_up() {
        let config = ClientConfig {
            max_reconnect_attempts: 1,
            ..ClientConfig::default()
        };
        let mut f = fixture(config);
        let end = connect(&mut f).await;
        assert!(end.close(CloseCode::INVALID_TOKEN, "Token inválido").await);
        wait_for(&f.manager, ConnectionState::GivenUp).await;
        assert_eq!(f.connector.connect_count(), 1);
        assert_eq!(f.manager.reconnect_attempts(), 1);

        f.manager.reinitialize();
        let _fresh = f.ends.next().await.unwrap();
        wait_for(&f.manager, ConnectionState::Connected).await;
        assert_eq!(f.manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialize_picks_up_late_login() {
        let mut f = fixture_with(ClientConfig::default(), MemoryIdentity::anonymous());
        settle().await;
        assert_eq!(f.connector.connect_count(), 0);

        f.identity.set(
            UserIdentity::new("u9").with_role("medico"),
            AuthToken::new("tok9"),
        );
        f.manager.reinitialize();
        let end = connect(&mut f).await;
        assert_eq!(end.target.url().path(), "/realtime/ws/u9");

        // Already connected: a second reinitialize does nothing.
        f.manager.reinitialize();
        settle().await;
        assert_eq!(f.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_sends_normal_close() {
        let mut f = fixture(ClientConfig::default());
        let mut end = connect(&mut f).await;
        let Fixture {
            manager, connector, ..
        } = f;
        manager.shutdown().await;

        assert_matches!(
            end.recv().await,
            Some(OutboundFrame::Close { code, .. }) if code == CloseCode::NORMAL
        );
        assert_eq!(end.recv().await, None);
        sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_reconnecting_cancels_retry() {
        let mut f = fixture(ClientConfig::default());
        let end = connect(&mut f).await;
        assert!(end.close(CloseCode::ABNORMAL, "").await);
        wait_for(&f.manager, ConnectionState::Reconnecting).await;

        let Fixture {
            manager,
            connector,
            mut ends,
            ..
        } = f;
        let mut states = manager.watch_state();
        manager.shutdown().await;

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connect_count(), 1);
        assert!(ends.try_next().is_none());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_heartbeat_and_closes() {
        let mut f = fixture(ClientConfig::default());
        let mut end = connect(&mut f).await;
        drop(f.manager);

        assert_matches!(
            end.recv().await,
            Some(OutboundFrame::Close { code, .. }) if code == CloseCode::NORMAL
        );
        // No ping follows: the only sender is gone.
        assert_eq!(end.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_forces_reconnect_when_enabled() {
        let config = ClientConfig {
            pong_timeout: Some(Duration::from_secs(60)),
            ..ClientConfig::default()
        };
        let mut f = fixture(config);
        let mut end = connect(&mut f).await;

        let mut pings = 0;
        let close = loop {
            match end.recv().await {
                Some(OutboundFrame::Text(_)) => pings += 1,
                Some(close @ OutboundFrame::Close { .. }) => break close,
                None => panic!("connection dropped without a close frame"),
            }
        };
        assert_eq!(pings, 2);
        assert_matches!(close, OutboundFrame::Close { code, .. } if code == CloseCode::HEARTBEAT_TIMEOUT);
        wait_for(&f.manager, ConnectionState::Reconnecting).await;
        assert_eq!(f.manager.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_replies_keep_connection_when_enabled() {
        let config = ClientConfig {
            pong_timeout: Some(Duration::from_secs(60)),
            ..ClientConfig::default()
        };
        let mut f = fixture(config);
        let mut end = connect(&mut f).await;
        for _ in 0..4 {
            assert_eq!(end.recv().await, Some(OutboundFrame::Text(r#"{"type":"ping"}"#.into())));
            assert!(end.send_envelope(MessageType::Pong, json!({})).await);
        }
        settle().await;
        assert!(f.manager.is_connected());
    }
}
