//! Wire envelope and codec.
//!
//! Every server-pushed frame is a JSON object `{ type, data, timestamp }`.
//! [`decode`] turns a raw text frame into an [`Envelope`]; [`encode`] is the
//! inverse, used by tests and tooling that stand in for the server.
//!
//! Client-to-server traffic is limited to [`ClientFrame`]s (heartbeat and
//! stats requests) plus arbitrary caller-supplied JSON.
//!
//! # Forward compatibility
//!
//! [`MessageType`] is a closed enumeration. An envelope whose `type` is not
//! one of its variants still decodes, as [`EnvelopeType::Unknown`], so the
//! receiver can log and ignore it without treating the frame as malformed.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DecodeError;

/// Recognized server message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Welcome message carrying the server's connection stats.
    ConnectionSuccess,
    /// A user-facing notification.
    Notification,
    /// An urgent alert, stored like a notification.
    Alert,
    /// A patient list (waiting, triage, ...) changed.
    ListUpdate,
    /// A prescription changed.
    PrescriptionUpdate,
    /// A patient record changed.
    PatientUpdate,
    /// Reply to a client `ping`.
    Pong,
    /// Connection statistics snapshot.
    Stats,
}

impl MessageType {
    /// Every recognized type, in wire-table order.
    pub const ALL: [Self; 8] = [
        Self::ConnectionSuccess,
        Self::Notification,
        Self::Alert,
        Self::ListUpdate,
        Self::PrescriptionUpdate,
        Self::PatientUpdate,
        Self::Pong,
        Self::Stats,
    ];

    /// The wire name of this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionSuccess => "connection_success",
            Self::Notification => "notification",
            Self::Alert => "alert",
            Self::ListUpdate => "list_update",
            Self::PrescriptionUpdate => "prescription_update",
            Self::PatientUpdate => "patient_update",
            Self::Pong => "pong",
            Self::Stats => "stats",
        }
    }

    /// Look up a type by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `type` of a decoded envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeType {
    /// One of the recognized types.
    Known(MessageType),
    /// A type this client does not act on. Carries the raw name for logging.
    Unknown(String),
}

impl EnvelopeType {
    fn from_wire(name: &str) -> Self {
        MessageType::from_wire(name).map_or_else(|| Self::Unknown(name.to_owned()), Self::Known)
    }

    /// The wire name, recognized or not.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(t) => t.as_str(),
            Self::Unknown(name) => name,
        }
    }
}

/// A decoded server message. Immutable once received.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Message type.
    pub message_type: EnvelopeType,
    /// Opaque payload.
    pub data: Value,
    /// Server-side emission time.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope of a recognized type stamped with the current time.
    #[must_use]
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type: EnvelopeType::Known(message_type),
            data,
            timestamp: Utc::now(),
        }
    }

    /// The recognized type, if any.
    #[must_use]
    pub fn known_type(&self) -> Option<MessageType> {
        match self.message_type {
            EnvelopeType::Known(t) => Some(t),
            EnvelopeType::Unknown(_) => None,
        }
    }

    /// Whether this envelope has the given recognized type.
    #[must_use]
    pub fn is(&self, message_type: MessageType) -> bool {
        self.known_type() == Some(message_type)
    }

    /// Read a string field from `data`, if present.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Decode a raw text frame into an [`Envelope`].
///
/// Fails on malformed JSON, a non-object frame, or a missing or mistyped
/// `type`, `data`, or `timestamp` field. Has no side effects.
///
/// Timestamps are ISO-8601. A timestamp without an offset (as emitted by a
/// naive `datetime.isoformat()`) is interpreted as UTC.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let message_type = match map.get("type") {
        None => return Err(DecodeError::MissingField("type")),
        Some(Value::String(name)) => EnvelopeType::from_wire(name),
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "type",
                expected: "string",
            });
        }
    };

    let data = map.remove("data").ok_or(DecodeError::MissingField("data"))?;

    let timestamp = match map.get("timestamp") {
        None => return Err(DecodeError::MissingField("timestamp")),
        Some(Value::String(raw_ts)) => parse_timestamp(raw_ts)?,
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "timestamp",
                expected: "string",
            });
        }
    };

    Ok(Envelope {
        message_type,
        data,
        timestamp,
    })
}

/// Serialize an envelope to its wire form.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    let mut map = Map::new();
    let _ = map.insert(
        "type".into(),
        Value::String(envelope.message_type.as_str().to_owned()),
    );
    let _ = map.insert("data".into(), envelope.data.clone());
    let _ = map.insert(
        "timestamp".into(),
        Value::String(envelope.timestamp.to_rfc3339()),
    );
    Value::Object(map).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_owned()))
}

/// Frames the client originates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat ping; the server answers with `pong`.
    Ping,
    /// Ask the server for a `stats` envelope.
    GetStats,
}

impl ClientFrame {
    /// Wire text of this frame.
    #[must_use]
    pub fn to_json(self) -> String {
        match self {
            Self::Ping => r#"{"type":"ping"}"#.to_owned(),
            Self::GetStats => r#"{"type":"get_stats"}"#.to_owned(),
        }
    }
}
