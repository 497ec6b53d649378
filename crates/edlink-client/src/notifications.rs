//! In-memory notification store.
//!
//! Holds the items built from `notification` and `alert` envelopes,
//! newest first. Items are only ever mutated by [`NotificationStore::mark_read`]
//! and only ever removed by [`NotificationStore::clear_all`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use edlink_core::{Envelope, MessageType, NotificationId};
use serde::{Deserialize, Serialize};

/// Notification urgency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational.
    Low,
    /// Default for notifications.
    #[default]
    Normal,
    /// Needs attention soon.
    High,
    /// Default for alerts.
    Urgent,
}

impl Priority {
    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// One stored notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    /// Unique id.
    pub id: NotificationId,
    /// Category from `data.type` (`info` when absent); `alert` for alerts.
    pub kind: String,
    /// Display text.
    pub message: String,
    /// The envelope's timestamp.
    pub received_at: DateTime<Utc>,
    /// Whether the user has seen it.
    pub read: bool,
    /// Urgency.
    pub priority: Priority,
}

/// Newest-first notification list.
#[derive(Clone, Debug, Default)]
pub struct NotificationStore {
    items: VecDeque<NotificationItem>,
}

impl NotificationStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an item from a `notification` or `alert` envelope and prepend
    /// it. Returns a copy of the new item; other envelope types are ignored.
    pub fn add_from_envelope(&mut self, envelope: &Envelope) -> Option<NotificationItem> {
        let (kind, default_priority) = match envelope.known_type()? {
            MessageType::Notification => (
                envelope.data_str("type").unwrap_or("info").to_owned(),
                Priority::Normal,
            ),
            MessageType::Alert => ("alert".to_owned(), Priority::Urgent),
            _ => return None,
        };
        let priority = envelope
            .data_str("priority")
            .and_then(Priority::from_wire)
            .unwrap_or(default_priority);

        let item = NotificationItem {
            id: NotificationId::new(),
            kind,
            message: envelope.data_str("message").unwrap_or_default().to_owned(),
            received_at: envelope.timestamp,
            read: false,
            priority,
        };
        self.items.push_front(item.clone());
        Some(item)
    }

    /// Mark an item read. Returns whether anything changed; unknown or
    /// already-read ids are a no-op.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        match self.items.iter_mut().find(|item| &item.id == id) {
            Some(item) if !item.read => {
                item.read = true;
                true
            }
            _ => false,
        }
    }

    /// Remove every item.
    pub fn clear_all(&mut self) {
        self.items.clear();
    }

    /// Number of unread items.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|item| !item.read).count()
    }

    /// Snapshot of all items, newest first.
    #[must_use]
    pub fn items(&self) -> Vec<NotificationItem> {
        self.items.iter().cloned().collect()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
