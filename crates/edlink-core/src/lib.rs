//! # edlink-core
//!
//! Foundation types for the edlink emergency-department realtime client.
//!
//! This crate provides the shared vocabulary the client and binary depend on:
//!
//! - **Envelope**: the server-pushed `{ type, data, timestamp }` unit and its
//!   closed [`MessageType`] enumeration
//! - **Codec**: [`decode`] / [`encode`] for envelopes, [`ClientFrame`] for
//!   client-to-server frames (`ping`, `get_stats`)
//! - **Branded IDs**: [`NotificationId`] as a newtype for type safety
//! - **Errors**: [`DecodeError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use envelope::{ClientFrame, Envelope, EnvelopeType, MessageType, decode, encode};
pub use errors::DecodeError;
pub use ids::NotificationId;
