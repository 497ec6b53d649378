//! Connection session state machine.
//!
//! [`SessionMachine`] is sans-IO: it consumes [`SessionEvent`]s and returns
//! the [`Action`]s the driver must perform (open a transport, send a frame,
//! arm or disarm a timer, deliver an envelope). All timing and I/O live in
//! the driver, which lets every transition be tested synchronously.
//!
//! # States
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─Opened─▶ Connected
//!      ▲                    │  ▲                  │
//!      │ close 1000         │  └──RetryDue── Reconnecting ◀─ unexpected close
//!      └────────────────────┴──────────────────── (under the ceiling)
//!                           └───────▶ GivenUp ◀── unexpected close at the ceiling
//! ```
//!
//! # Stale events
//!
//! Every connection attempt gets a fresh [`AttemptId`]. Transport, heartbeat
//! and retry events carry the id of the attempt that produced them; events
//! for any attempt other than the current one are ignored, as is everything
//! after [`SessionMachine::shutdown`].

use std::fmt;
use std::time::Duration;

use edlink_core::{Envelope, MessageType, decode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::close::CloseCode;
use crate::heartbeat::HeartbeatScheduler;
use crate::identity::ConnectionTarget;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none pending.
    #[default]
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// The transport is open.
    Connected,
    /// Waiting out the reconnection delay.
    Reconnecting,
    /// The attempt ceiling was reached. Terminal until re-initialized.
    GivenUp,
}

impl ConnectionState {
    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::GivenUp => "given_up",
        }
    }

    /// Whether no connection is active or pending.
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Disconnected | Self::GivenUp)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one connection attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input to the machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport finished opening.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// The transport closed or failed to open.
    Closed {
        /// Close code; [`CloseCode::ABNORMAL`] when there was none.
        code: CloseCode,
        /// Close reason or error text.
        reason: String,
    },
    /// The heartbeat timer fired.
    HeartbeatDue,
    /// The reconnection delay elapsed.
    RetryDue,
}

/// Output of the machine, performed by the driver in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Open a transport to `target` for `attempt`.
    Open {
        /// The new attempt.
        attempt: AttemptId,
        /// Where to connect.
        target: ConnectionTarget,
    },
    /// Send a `ping` frame on the open transport. Report success with
    /// [`SessionMachine::ping_sent`].
    Send(String),
    /// Close the open transport.
    Close {
        /// Close code to send.
        code: CloseCode,
        /// Close reason to send.
        reason: String,
    },
    /// Arm the heartbeat timer for `attempt`.
    StartHeartbeat {
        /// The connected attempt.
        attempt: AttemptId,
    },
    /// Disarm the heartbeat timer.
    StopHeartbeat,
    /// Arm the reconnection timer.
    ScheduleRetry {
        /// The attempt whose loss triggered the retry.
        attempt: AttemptId,
        /// How long to wait.
        delay: Duration,
    },
    /// Disarm the reconnection timer.
    CancelRetry,
    /// Route a decoded envelope to the store or the topic bus.
    Deliver(Envelope),
}

/// The connection state machine. See the module docs.
#[derive(Debug)]
pub struct SessionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    pong_timeout: Option<Duration>,
    heartbeat: HeartbeatScheduler,
    reconnect_attempts: u32,
    attempt: AttemptId,
    target: Option<ConnectionTarget>,
    terminated: bool,
}

impl SessionMachine {
    /// A disconnected machine.
    #[must_use]
    pub fn new(policy: ReconnectPolicy, pong_timeout: Option<Duration>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            pong_timeout,
            heartbeat: HeartbeatScheduler::new(),
            reconnect_attempts: 0,
            attempt: AttemptId::default(),
            target: None,
            terminated: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful connection.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// The most recently issued attempt.
    #[must_use]
    pub fn current_attempt(&self) -> AttemptId {
        self.attempt
    }

    /// When the last `ping` was sent.
    #[must_use]
    pub fn last_ping_sent_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.heartbeat.last_ping_sent_at()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Start a fresh connection to `target`. Only acts when idle
    /// (`Disconnected` or `GivenUp`); resets the reconnection counter.
    pub fn connect(&mut self, target: ConnectionTarget) -> Vec<Action> {
        if self.terminated || !self.state.is_idle() {
            debug!(state = %self.state, "connect ignored, session not idle");
            return Vec::new();
        }
        self.reconnect_attempts = 0;
        self.target = Some(target);
        self.open_next()
    }

    /// The `ping` from the last [`Action::Send`] was queued on the transport.
    /// Only then does it count as sent.
    pub fn ping_sent(&mut self) {
        if self.state == ConnectionState::Connected && !self.terminated {
            self.heartbeat.record_ping(Instant::now());
        }
    }

    /// Feed one event produced by `attempt`.
    pub fn handle(&mut self, attempt: AttemptId, event: SessionEvent) -> Vec<Action> {
        if self.terminated {
            return Vec::new();
        }
        if attempt != self.attempt {
            debug!(%attempt, current = %self.attempt, ?event, "ignoring event from stale attempt");
            return Vec::new();
        }
        match event {
            SessionEvent::Opened => self.on_opened(),
            SessionEvent::Frame(raw) => self.on_frame(&raw),
            SessionEvent::Closed { code, reason } => self.on_closed(code, &reason),
            SessionEvent::HeartbeatDue => self.on_heartbeat(),
            SessionEvent::RetryDue => self.on_retry(),
        }
    }

    /// Intentional teardown. Disarms every timer and closes the live
    /// transport with [`CloseCode::NORMAL`]; all later events are ignored.
    pub fn shutdown(&mut self) -> Vec<Action> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        self.heartbeat.stop();
        let mut actions = vec![Action::StopHeartbeat, Action::CancelRetry];
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            actions.push(Action::Close {
                code: CloseCode::NORMAL,
                reason: "client shutdown".into(),
            });
        }
        self.transition(ConnectionState::Disconnected);
        actions
    }

    fn open_next(&mut self) -> Vec<Action> {
        let Some(target) = self.target.clone() else {
            return Vec::new();
        };
        self.attempt = self.attempt.next();
        self.transition(ConnectionState::Connecting);
        vec![Action::Open {
            attempt: self.attempt,
            target,
        }]
    }

    fn on_opened(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.reconnect_attempts = 0;
        self.heartbeat.start();
        self.transition(ConnectionState::Connected);
        vec![Action::StartHeartbeat {
            attempt: self.attempt,
        }]
    }

    fn on_frame(&mut self, raw: &str) -> Vec<Action> {
        match decode(raw) {
            Ok(envelope) => {
                if envelope.is(MessageType::Pong) {
                    self.heartbeat.record_pong();
                }
                vec![Action::Deliver(envelope)]
            }
            Err(error) => {
                warn!(%error, len = raw.len(), "discarding undecodable frame");
                Vec::new()
            }
        }
    }

    fn on_closed(&mut self, code: CloseCode, reason: &str) -> Vec<Action> {
        let was_connected = match self.state {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => false,
            _ => return Vec::new(),
        };

        let mut actions = Vec::new();
        if was_connected {
            self.heartbeat.stop();
            actions.push(Action::StopHeartbeat);
        }

        if code.is_auth_rejection() {
            warn!(%code, reason, "server rejected credentials");
        }

        match self.policy.decide(self.reconnect_attempts, code) {
            ReconnectDecision::Stop => {
                info!(%code, reason, "connection closed");
                self.transition(ConnectionState::Disconnected);
            }
            ReconnectDecision::Retry { attempt, delay } => {
                self.reconnect_attempts = attempt;
                info!(
                    %code,
                    reason,
                    retry = attempt,
                    max = self.policy.max_attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "connection lost, scheduling reconnect"
                );
                self.transition(ConnectionState::Reconnecting);
                actions.push(Action::ScheduleRetry {
                    attempt: self.attempt,
                    delay,
                });
            }
            ReconnectDecision::GiveUp { attempts } => {
                self.reconnect_attempts = attempts;
                warn!(
                    %code,
                    reason,
                    max = self.policy.max_attempts(),
                    "reconnect attempts exhausted, giving up"
                );
                self.transition(ConnectionState::GivenUp);
            }
        }
        actions
    }

    fn on_heartbeat(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        let now = Instant::now();
        if let Some(timeout) = self.pong_timeout {
            if self.heartbeat.is_overdue(now, timeout) {
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "no pong within timeout, dropping connection"
                );
                let reason = "pong timeout";
                let mut actions = vec![Action::Close {
                    code: CloseCode::HEARTBEAT_TIMEOUT,
                    reason: reason.into(),
                }];
                actions.extend(self.on_closed(CloseCode::HEARTBEAT_TIMEOUT, reason));
                return actions;
            }
        }
        self.heartbeat
            .on_tick()
            .map(Action::Send)
            .into_iter()
            .collect()
    }

    fn on_retry(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        self.open_next()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, attempt = %self.attempt, "state transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use edlink_core::logging::capture_logs;
    use tracing::Level;

    use super::*;
    use crate::config::ClientConfig;
    use crate::identity::{AuthToken, IdentityContext};

    fn target() -> ConnectionTarget {
        let identity = IdentityContext {
            user_id: "u1".into(),
            role: "enfermera".into(),
            area: "emergencia".into(),
            token: AuthToken::new("tok"),
        };
        ConnectionTarget::build(&ClientConfig::default(), &identity).unwrap()
    }

    fn machine() -> SessionMachine {
        SessionMachine::new(ReconnectPolicy::default(), None)
    }

    fn opened_attempt(actions: &[Action]) -> AttemptId {
        match actions {
            [Action::Open { attempt, .. }] => *attempt,
            other => panic!("expected a single Open, got {other:?}"),
        }
    }

    fn closed(code: u16) -> SessionEvent {
        SessionEvent::Closed {
            code: CloseCode::from(code),
            reason: String::new(),
        }
    }

    /// Connect and open, returning the connected attempt.
    fn connected(m: &mut SessionMachine) -> AttemptId {
        let a = opened_attempt(&m.connect(target()));
        let _ = m.handle(a, SessionEvent::Opened);
        a
    }

    #[test]
    fn connect_moves_to_connecting() {
        let mut m = machine();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        let actions = m.connect(target());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_matches!(actions.as_slice(), [Action::Open { .. }]);
    }

    #[test]
    fn connect_ignored_while_active() {
        let mut m = machine();
        let _ = m.connect(target());
        assert!(m.connect(target()).is_empty());
        let _ = m.handle(m.current_attempt(), SessionEvent::Opened);
        assert!(m.connect(target()).is_empty());
    }

    #[test]
    fn opened_starts_heartbeat_and_resets_counter() {
        let mut m = machine();
        let a = opened_attempt(&m.connect(target()));
        let actions = m.handle(a, SessionEvent::Opened);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(actions, vec![Action::StartHeartbeat { attempt: a }]);
        assert_eq!(m.reconnect_attempts(), 0);
    }

    #[test]
    fn normal_close_disconnects_without_retry() {
        let mut m = machine();
        let a = connected(&mut m);
        let actions = m.handle(a, closed(1000));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(actions, vec![Action::StopHeartbeat]);
    }

    #[test]
    fn unexpected_close_schedules_retry() {
        let mut m = machine();
        let a = connected(&mut m);
        let actions = m.handle(a, closed(1006));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert_eq!(m.reconnect_attempts(), 1);
        assert_eq!(
            actions,
            vec![
                Action::StopHeartbeat,
                Action::ScheduleRetry {
                    attempt: a,
                    delay: Duration::from_secs(5),
                },
            ]
        );
    }

    #[test]
    fn counter_two_becomes_three() {
        let mut m = machine();
        let mut a = opened_attempt(&m.connect(target()));
        // Two failed opens bring the counter to 2.
        for _ in 0..2 {
            let _ = m.handle(a, closed(1006));
            a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        }
        let _ = m.handle(a, SessionEvent::Opened);
        assert_eq!(m.reconnect_attempts(), 0);

        // Re-run the scenario from a connected state with the counter at 2.
        let mut m = machine();
        let mut a = connected(&mut m);
        let _ = m.handle(a, closed(1011));
        a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        let _ = m.handle(a, closed(1006));
        a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        assert_eq!(m.reconnect_attempts(), 2);
        let actions = m.handle(a, closed(1006));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert_eq!(m.reconnect_attempts(), 3);
        assert_matches!(
            actions.as_slice(),
            [Action::ScheduleRetry { delay, .. }] if *delay == Duration::from_secs(5)
        );
    }

    #[test]
    fn five_consecutive_closes_give_up() {
        let mut m = machine();
        let mut a = connected(&mut m);
        let mut closes = 0;
        let mut retries = 0;
        loop {
            let actions = m.handle(a, closed(1006));
            closes += 1;
            if m.state() == ConnectionState::GivenUp {
                assert!(actions.iter().all(|x| !matches!(x, Action::ScheduleRetry { .. })));
                break;
            }
            assert_eq!(m.state(), ConnectionState::Reconnecting);
            retries += 1;
            a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
            assert!(m.reconnect_attempts() < 5);
        }
        assert_eq!(closes, 5);
        assert_eq!(retries, 4);
        assert_eq!(m.reconnect_attempts(), 5);
        // No sixth attempt, whatever arrives now.
        assert!(m.handle(a, SessionEvent::RetryDue).is_empty());
        assert!(m.handle(a, closed(1006)).is_empty());
        assert_eq!(m.state(), ConnectionState::GivenUp);
    }

    #[test]
    fn intentional_close_never_retries_regardless_of_counter() {
        let mut m = machine();
        let mut a = connected(&mut m);
        let _ = m.handle(a, closed(1006));
        a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        let _ = m.handle(a, SessionEvent::Opened);
        let _ = m.handle(a, closed(1006));
        a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        let actions = m.handle(a, closed(1000));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(actions.is_empty());
    }

    #[test]
    fn failed_open_counts_as_unexpected_close() {
        let mut m = machine();
        let a = opened_attempt(&m.connect(target()));
        let actions = m.handle(a, closed(1006));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        // Heartbeat never started, so nothing to stop.
        assert_matches!(actions.as_slice(), [Action::ScheduleRetry { .. }]);
    }

    #[test]
    fn zero_ceiling_gives_up_from_connecting() {
        let mut m = SessionMachine::new(ReconnectPolicy::new(0, Duration::ZERO), None);
        let a = opened_attempt(&m.connect(target()));
        assert!(m.handle(a, closed(1006)).is_empty());
        assert_eq!(m.state(), ConnectionState::GivenUp);
    }

    #[test]
    fn stale_events_are_ignored() {
        let mut m = machine();
        let old = connected(&mut m);
        let _ = m.handle(old, closed(1006));
        let new = opened_attempt(&m.handle(old, SessionEvent::RetryDue));
        assert_ne!(old, new);

        assert!(m.handle(old, SessionEvent::Opened).is_empty());
        assert!(m.handle(old, closed(1006)).is_empty());
        assert!(m.handle(old, SessionEvent::HeartbeatDue).is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.reconnect_attempts(), 1);
    }

    #[test]
    fn frames_are_delivered_in_any_state() {
        let mut m = machine();
        let a = opened_attempt(&m.connect(target()));
        let raw = r#"{"type":"list_update","data":{"episodeId":"E1"},"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert_matches!(
            m.handle(a, SessionEvent::Frame(raw.into())).as_slice(),
            [Action::Deliver(env)] if env.is(MessageType::ListUpdate)
        );
        let _ = m.handle(a, SessionEvent::Opened);
        assert_eq!(m.handle(a, SessionEvent::Frame(raw.into())).len(), 1);
    }

    #[test]
    fn decode_failure_is_logged_and_next_frame_decodes() {
        let (logs, _guard) = capture_logs();
        let mut m = machine();
        let a = connected(&mut m);

        assert!(m.handle(a, SessionEvent::Frame("{oops".into())).is_empty());
        assert!(logs.has_event(Level::WARN, "discarding undecodable frame"));
        assert_eq!(m.state(), ConnectionState::Connected);

        let raw = r#"{"type":"stats","data":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert_eq!(m.handle(a, SessionEvent::Frame(raw.into())).len(), 1);
    }

    #[test]
    fn heartbeat_sends_ping_only_when_connected() {
        let mut m = machine();
        let a = opened_attempt(&m.connect(target()));
        assert!(m.handle(a, SessionEvent::HeartbeatDue).is_empty());
        let _ = m.handle(a, SessionEvent::Opened);
        assert_eq!(
            m.handle(a, SessionEvent::HeartbeatDue),
            vec![Action::Send(r#"{"type":"ping"}"#.into())]
        );
        assert!(m.last_ping_sent_at().is_none());
        m.ping_sent();
        assert!(m.last_ping_sent_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unsent_pings_are_not_recorded() {
        let mut m = SessionMachine::new(ReconnectPolicy::default(), Some(Duration::from_secs(60)));
        let a = connected(&mut m);
        // Every ping is dropped by a full queue: no record, no pong deadline.
        for _ in 0..4 {
            assert_matches!(
                m.handle(a, SessionEvent::HeartbeatDue).as_slice(),
                [Action::Send(_)]
            );
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        assert!(m.last_ping_sent_at().is_none());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn ping_sent_ignored_when_not_connected() {
        let mut m = machine();
        let a = connected(&mut m);
        let _ = m.handle(a, closed(1006));
        m.ping_sent();
        assert!(m.last_ping_sent_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_pong_drops_connection() {
        let mut m = SessionMachine::new(ReconnectPolicy::default(), Some(Duration::from_secs(60)));
        let a = connected(&mut m);
        assert_eq!(m.handle(a, SessionEvent::HeartbeatDue).len(), 1);
        m.ping_sent();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(m.handle(a, SessionEvent::HeartbeatDue).len(), 1);
        m.ping_sent();
        tokio::time::advance(Duration::from_secs(30)).await;

        let actions = m.handle(a, SessionEvent::HeartbeatDue);
        assert_matches!(
            actions.as_slice(),
            [
                Action::Close { code, .. },
                Action::StopHeartbeat,
                Action::ScheduleRetry { .. },
            ] if *code == CloseCode::HEARTBEAT_TIMEOUT
        );
        assert_eq!(m.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_keeps_connection_alive() {
        let mut m = SessionMachine::new(ReconnectPolicy::default(), Some(Duration::from_secs(60)));
        let a = connected(&mut m);
        let pong = r#"{"type":"pong","data":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        for _ in 0..5 {
            assert_matches!(
                m.handle(a, SessionEvent::HeartbeatDue).as_slice(),
                [Action::Send(_)]
            );
            m.ping_sent();
            let _ = m.handle(a, SessionEvent::Frame(pong.into()));
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn shutdown_closes_and_disarms() {
        let mut m = machine();
        let a = connected(&mut m);
        let actions = m.shutdown();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(
            actions,
            vec![
                Action::StopHeartbeat,
                Action::CancelRetry,
                Action::Close {
                    code: CloseCode::NORMAL,
                    reason: "client shutdown".into(),
                },
            ]
        );
        assert!(m.handle(a, closed(1006)).is_empty());
        assert!(m.connect(target()).is_empty());
        assert!(m.shutdown().is_empty());
    }

    #[test]
    fn shutdown_while_reconnecting_blocks_retry() {
        let mut m = machine();
        let a = connected(&mut m);
        let _ = m.handle(a, closed(1006));
        let actions = m.shutdown();
        assert!(!actions.iter().any(|x| matches!(x, Action::Close { .. })));
        assert!(m.handle(a, SessionEvent::RetryDue).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_after_given_up() {
        let mut m = SessionMachine::new(ReconnectPolicy::new(2, Duration::ZERO), None);
        let a = connected(&mut m);
        let _ = m.handle(a, closed(1006));
        let a = opened_attempt(&m.handle(a, SessionEvent::RetryDue));
        let _ = m.handle(a, closed(1006));
        assert_eq!(m.state(), ConnectionState::GivenUp);
        assert_eq!(m.reconnect_attempts(), 2);

        let _ = opened_attempt(&m.connect(target()));
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.reconnect_attempts(), 0);
    }

    #[test]
    fn auth_rejection_is_logged_and_retried() {
        let (logs, _guard) = capture_logs();
        let mut m = machine();
        let a = connected(&mut m);
        let _ = m.handle(a, closed(4001));
        assert!(logs.has_event(Level::WARN, "server rejected credentials"));
        assert_eq!(m.state(), ConnectionState::Reconnecting);
    }
}
