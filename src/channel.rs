//! The notification channel.
//!
//! Every socket's readiness notifications travel through one FIFO queue,
//! tagged with the socket's identifier. Backend threads post into it via
//! a [`Poster`]; a single dispatch thread drains it and hands each entry
//! to the demultiplexer.

use crate::error::{Error, Result};
use crate::socket::RawFd;

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Identifier of the socket the notification is meant for.
    pub tag: u32,

    /// Descriptor the OS layer reported the event on.
    pub fd: RawFd,

    /// Raw network-event code (one of the `NET_*` constants).
    pub event: u32,

    /// Error attached to the event; only meaningful for `NET_CONNECT`.
    pub error: u16,
}

impl Notification {
    /// Notification for `event` on `fd`, without an error.
    pub fn new(tag: u32, fd: RawFd, event: u32) -> Self {
        Self {
            tag,
            fd,
            event,
            error: 0,
        }
    }

    /// Attaches an error code.
    pub fn with_error(mut self, error: u16) -> Self {
        self.error = error;
        self
    }

    /// Builds a notification from a packed select reply.
    ///
    /// The low word of `reply` is the event code and the high word the
    /// error, the layout window-message based socket notification uses.
    pub fn select_reply(tag: u32, fd: RawFd, reply: u32) -> Self {
        Self {
            tag,
            fd,
            event: reply & 0xFFFF,
            error: (reply >> 16) as u16,
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Notification>>,
    ready: Condvar,
    closed: AtomicBool,
}

/// Receiving end of the notification channel.
pub struct Channel {
    shared: Arc<Shared>,
}

/// Sending end of the notification channel.
///
/// Cheap to clone; handed to backend threads and to collaborators that
/// want to route their own tags through the same dispatch loop.
#[derive(Clone)]
pub struct Poster {
    shared: Arc<Shared>,
}

impl Channel {
    /// Allocates a new, open channel.
    pub fn create() -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(64)),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns a sending handle for this channel.
    pub fn poster(&self) -> Poster {
        Poster {
            shared: self.shared.clone(),
        }
    }

    /// Removes every queued notification tagged `tag`.
    ///
    /// Returns how many were dropped. Notifications already taken off the
    /// queue are not affected.
    pub fn purge(&self, tag: u32) -> usize {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|n| n.tag != tag);
        before - queue.len()
    }

    /// Takes the oldest notification without blocking.
    pub fn try_recv(&self) -> Option<Notification> {
        self.shared.queue.lock().pop_front()
    }

    /// Takes the oldest notification, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout or once the channel is destroyed. A
    /// timeout too large to represent as a deadline waits indefinitely.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.shared.queue.lock();

        loop {
            if let Some(notification) = queue.pop_front() {
                return Some(notification);
            }

            if self.is_closed() {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .ready
                        .wait_until(&mut queue, deadline)
                        .timed_out()
                    {
                        return queue.pop_front();
                    }
                }
                None => self.shared.ready.wait(&mut queue),
            }
        }
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the channel is destroyed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the channel.
    ///
    /// Queued notifications are discarded, a blocked receiver wakes up
    /// and every later [`Poster::post`] fails.
    pub fn destroy(&self) {
        let mut queue = self.shared.queue.lock();
        self.shared.closed.store(true, Ordering::Release);
        queue.clear();
        self.shared.ready.notify_all();
    }
}

impl Poster {
    /// Appends `notification` to the channel.
    pub fn post(&self, notification: Notification) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }

        queue.push_back(notification);
        self.shared.ready.notify_one();

        Ok(())
    }

    /// Returns `true` once the channel is destroyed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
