//! Error types for the wire codec.

use thiserror::Error;

/// Why a raw frame could not be decoded into an [`Envelope`](crate::Envelope).
///
/// Decode failures are always local: the caller logs and discards the
/// frame, and the connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,
    /// A required envelope field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A required field is present but has the wrong JSON type.
    #[error("field `{field}` must be a {expected}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// The expected JSON type.
        expected: &'static str,
    },
    /// The `timestamp` string is not ISO-8601.
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}
