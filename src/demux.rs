//! Routing of channel notifications back to their sockets.

use crate::channel::Notification;
use crate::event::SocketEvent;
use crate::registry::Registry;

use parking_lot::Mutex;
use tracing::trace;

/// What happened to a dispatched notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The owning socket's callback received this event.
    Delivered(SocketEvent),

    /// The tag is ours but the notification was stale or carried an
    /// unmapped event code; nothing was delivered.
    Dropped,

    /// The tag is outside the socket identifier range and was passed to
    /// the default handler.
    Unhandled,
}

/// Resolves `notification` to its socket and delivers it.
///
/// The lookup, descriptor check and detected-state update happen under
/// the registry lock. The callback runs after the lock is released so it
/// can attach, detach or re-enable sockets without deadlocking.
pub(crate) fn demultiplex(registry: &Mutex<Registry>, notification: Notification) -> Dispatch {
    let Notification { tag, fd, event, error } = notification;

    let (socket, kind) = {
        let registry = registry.lock();
        if !registry.is_valid(tag) {
            return Dispatch::Unhandled;
        }

        let Some(socket) = registry.lookup(tag) else {
            trace!(tag, "notification for empty slot dropped");
            return Dispatch::Dropped;
        };

        let kind = SocketEvent::classify(event, error);
        if !socket.record_if_owner(fd, kind) {
            trace!(tag, ?fd, "stale notification dropped");
            return Dispatch::Dropped;
        }

        (socket, kind)
    };

    match kind {
        Some(kind) => {
            trace!(tag, ?kind, "delivering notification");
            socket.notify_state_change(kind);
            Dispatch::Delivered(kind)
        }
        None => {
            trace!(tag, event, "unmapped event code ignored");
            Dispatch::Dropped
        }
    }
}
