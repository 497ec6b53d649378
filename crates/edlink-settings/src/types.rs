//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "realtime": { "host": "ed.hospital.local", "port": 8000, "secure": true },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdlinkSettings {
    /// Realtime connection settings.
    pub realtime: RealtimeSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl EdlinkSettings {
    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.realtime.validate()
    }
}

/// Realtime server location, identity defaults, and connection timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
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
    /// Interval between `ping` frames in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Treat a `ping` left unanswered this long as a dropped connection.
    /// Disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_timeout_ms: Option<u64>,
    /// Give up on a connection attempt whose handshake has not completed
    /// within this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Fixed delay before each reconnection attempt in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Events buffered per topic bus subscriber. Applies to the process-wide
    /// bus only when passed to `TopicBus::init_global` before first use.
    pub topic_bus_capacity: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            secure: false,
            path: "/realtime/ws".to_string(),
            default_role: "enfermera".to_string(),
            default_area: "emergencia".to_string(),
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: None,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            send_queue_capacity: 256,
            topic_bus_capacity: 256,
        }
    }
}

impl RealtimeSettings {
    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("realtime.host is empty".into()));
        }
        if self.port == 0 {
            return Err(SettingsError::InvalidValue("realtime.port must be non-zero".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.heartbeatIntervalMs must be non-zero".into(),
            ));
        }
        if self.pong_timeout_ms == Some(0) {
            return Err(SettingsError::InvalidValue(
                "realtime.pongTimeoutMs must be non-zero when set".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.connectTimeoutMs must be non-zero".into(),
            ));
        }
        if self.send_queue_capacity == 0 || self.topic_bus_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "queue capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive passed to the subscriber (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
