//! Optional native-notification side effect.

use crate::notifications::NotificationItem;

/// Surfaces a new notification outside the app (desktop toast, sound, log).
///
/// Called once per stored `notification` item, after it is in the store.
/// Implementations must not block; whatever they do never affects the
/// store.
pub trait Notifier: Send + Sync {
    /// Show `item`.
    fn notify(&self, item: &NotificationItem);
}

impl<F> Notifier for F
where
    F: Fn(&NotificationItem) + Send + Sync,
{
    fn notify(&self, item: &NotificationItem) {
        self(item);
    }
}
