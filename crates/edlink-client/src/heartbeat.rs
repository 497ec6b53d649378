//! Heartbeat ping scheduling.
//!
//! [`HeartbeatScheduler`] is the bookkeeping half: it decides whether a tick
//! produces a `ping` frame, records when the last one went out, and tracks
//! the oldest unanswered ping. [`run_heartbeat`] is the timer half: a task
//! that fires a callback every interval until cancelled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use edlink_core::ClientFrame;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Liveness bookkeeping for one session.
#[derive(Clone, Debug, Default)]
pub struct HeartbeatScheduler {
    running: bool,
    last_ping_sent_at: Option<DateTime<Utc>>,
    awaiting_pong_since: Option<Instant>,
}

impl HeartbeatScheduler {
    /// A stopped scheduler with no ping history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin emitting pings. Any outstanding ping from a previous
    /// connection is forgotten.
    pub fn start(&mut self) {
        self.running = true;
        self.awaiting_pong_since = None;
    }

    /// Stop emitting pings.
    pub fn stop(&mut self) {
        self.running = false;
        self.awaiting_pong_since = None;
    }

    /// Whether pings are being emitted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Handle a timer tick. Returns the `ping` frame to send, or `None`
    /// when stopped. Nothing is recorded until [`record_ping`](Self::record_ping).
    #[must_use]
    pub fn on_tick(&self) -> Option<String> {
        self.running.then(|| ClientFrame::Ping.to_json())
    }

    /// The `ping` from the last tick went out at `now`.
    pub fn record_ping(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        self.last_ping_sent_at = Some(Utc::now());
        if self.awaiting_pong_since.is_none() {
            self.awaiting_pong_since = Some(now);
        }
    }

    /// The server answered.
    pub fn record_pong(&mut self) {
        self.awaiting_pong_since = None;
    }

    /// When the most recent `ping` was sent. Survives stop/start.
    #[must_use]
    pub fn last_ping_sent_at(&self) -> Option<DateTime<Utc>> {
        self.last_ping_sent_at
    }

    /// Whether the oldest unanswered ping has been outstanding for at
    /// least `timeout`.
    #[must_use]
    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.awaiting_pong_since
            .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
    }
}

/// Why [`run_heartbeat`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The heartbeat was cancelled externally.
    Cancelled,
    /// The tick callback asked to stop.
    Stopped,
}

/// Call `on_tick` every `interval` until `cancel` fires or the callback
/// returns `false`. The first call happens one full interval after start.
pub async fn run_heartbeat<F>(
    interval: Duration,
    cancel: CancellationToken,
    mut on_tick: F,
) -> HeartbeatResult
where
    F: FnMut() -> bool,
{
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                if !on_tick() {
                    return HeartbeatResult::Stopped;
                }
            }
        }
    }
}
