//! Client configuration.

use std::time::Duration;

use edlink_settings::RealtimeSettings;

use crate::reconnect::ReconnectPolicy;

/// Runtime configuration for a [`RealtimeManager`](crate::RealtimeManager).
///
/// Usually derived from the loaded [`RealtimeSettings`]; the defaults match
/// the settings defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Use `wss` instead of `ws`.
    pub secure: bool,
    /// Path prefix; the user id is appended as the last segment.
    pub path: String,
    /// Role sent when the identity does not carry one.
    pub default_role: String,
    /// Area sent when the identity does not carry one.
    pub default_area: String,
    /// Interval between `ping` frames.
    pub heartbeat_interval: Duration,
    /// Unanswered-ping window after which the connection is dropped.
    /// `None` disables the check.
    pub pong_timeout: Option<Duration>,
    /// Handshake deadline; an attempt that takes longer counts as an
    /// abnormal close.
    pub connect_timeout: Duration,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
}

impl ClientConfig {
    /// The reconnection policy described by this config.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_reconnect_attempts, self.reconnect_delay)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&RealtimeSettings::default())
    }
}

impl From<&RealtimeSettings> for ClientConfig {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            secure: settings.secure,
            path: settings.path.clone(),
            default_role: settings.default_role.clone(),
            default_area: settings.default_area.clone(),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            pong_timeout: settings.pong_timeout_ms.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            send_queue_capacity: settings.send_queue_capacity,
        }
    }
}
