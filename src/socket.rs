//! Caller-owned socket handle.
//!
//! A [`Socket`] wraps a raw descriptor that the application created and
//! owns. The manager only ever holds a weak reference to it, so the
//! socket's lifetime stays entirely in the caller's hands.

use crate::event::{EventFlags, SocketEvent};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Raw descriptor type of the platform socket layer.
#[cfg(unix)]
pub type RawFd = std::os::fd::RawFd;

/// Raw descriptor type of the platform socket layer.
#[cfg(windows)]
pub type RawFd = std::os::windows::io::RawSocket;

/// Callback invoked when a notification changes the socket's state.
pub type StateCallback = Arc<dyn Fn(SocketEvent) + Send + Sync>;

/// Identifier assigned to an attached socket.
///
/// It doubles as the notification tag: every notification posted for
/// the socket carries this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u32);

impl SocketId {
    pub(crate) const fn new(tag: u32) -> Self {
        Self(tag)
    }

    /// Notification tag of this identifier.
    pub const fn tag(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Whether the socket listens for connections or carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A listening socket; it only reports incoming connections.
    Server,
    /// A connected or connecting socket.
    Client,
}

/// Mutable part of a socket, guarded by a single lock.
struct State {
    fd: Option<RawFd>,
    id: Option<SocketId>,
    detected: EventFlags,
}

/// A socket as seen by the notification manager.
pub struct Socket {
    role: Role,
    state: Mutex<State>,
    callback: RwLock<Option<StateCallback>>,
}

impl Socket {
    /// Wraps `fd` for use with a [`SocketManager`](crate::SocketManager).
    ///
    /// The descriptor is not closed when the socket is dropped; it
    /// belongs to whoever created it.
    pub fn new(fd: RawFd, role: Role) -> Arc<Self> {
        Arc::new(Self {
            role,
            state: Mutex::new(State {
                fd: Some(fd),
                id: None,
                detected: EventFlags::EMPTY,
            }),
            callback: RwLock::new(None),
        })
    }

    /// Shorthand for a listening socket.
    pub fn server(fd: RawFd) -> Arc<Self> {
        Self::new(fd, Role::Server)
    }

    /// Shorthand for a connected or connecting socket.
    pub fn client(fd: RawFd) -> Arc<Self> {
        Self::new(fd, Role::Client)
    }

    /// Raw descriptor, or `None` once [`invalidate`](Self::invalidate)d.
    pub fn fd(&self) -> Option<RawFd> {
        self.state.lock().fd
    }

    /// Marks the descriptor as closed and returns the previous value.
    ///
    /// Notifications that still carry the old descriptor will no longer
    /// match and are dropped at dispatch.
    pub fn invalidate(&self) -> Option<RawFd> {
        self.state.lock().fd.take()
    }

    /// Whether the socket listens or connects.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns `true` for a listening socket.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Identifier assigned by the manager, if attached.
    pub fn id(&self) -> Option<SocketId> {
        self.state.lock().id
    }

    /// Events detected since the last [`clear_detected`](Self::clear_detected).
    pub fn detected(&self) -> EventFlags {
        self.state.lock().detected
    }

    /// Acknowledges `flags`, removing them from the detected set.
    pub fn clear_detected(&self, flags: EventFlags) {
        let mut state = self.state.lock();
        state.detected = state.detected & !flags;
    }

    /// Installs the state-change callback, replacing any previous one.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(SocketEvent) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Removes the state-change callback.
    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Invokes the state-change callback, if any.
    ///
    /// The callback is cloned out before the call so it may freely
    /// re-enter the socket or the manager.
    pub fn notify_state_change(&self, event: SocketEvent) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub(crate) fn set_id(&self, id: Option<SocketId>) {
        self.state.lock().id = id;
    }

    /// Records `event` if the socket still owns `fd`.
    ///
    /// Returns `false` when the descriptor does not match, in which case
    /// the notification is stale and nothing is recorded.
    pub(crate) fn record_if_owner(&self, fd: RawFd, event: Option<SocketEvent>) -> bool {
        let mut state = self.state.lock();
        if state.fd != Some(fd) {
            return false;
        }

        if let Some(event) = event {
            state.detected.record(event);
        }

        true
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Socket")
            .field("fd", &state.fd)
            .field("role", &self.role)
            .field("id", &state.id)
            .field("detected", &state.detected)
            .finish()
    }
}
