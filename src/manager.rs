//! Lifecycle management: the object the application owns.

use crate::builder::{DefaultHandler, ManagerBuilder};
use crate::channel::{Channel, Notification, Poster};
use crate::demux::{Dispatch, demultiplex};
use crate::error::{Error, Result};
use crate::event::EventMask;
use crate::registry::Registry;
use crate::select::AsyncSelect;
use crate::socket::{RawFd, Socket, SocketId};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Routes socket readiness to socket callbacks through one channel.
///
/// A `SocketManager` owns the notification channel, the registry of
/// attached sockets and the resolved async-select capability. It is
/// `Send + Sync`: sockets may be attached, detached and enabled from any
/// thread, while a single thread drives [`pump`](Self::pump) or
/// [`dispatch_pending`](Self::dispatch_pending).
///
/// The registry lock is the one mutual-exclusion domain shared by
/// attach, detach (including the channel purge) and dispatch lookups.
pub struct SocketManager {
    registry: Mutex<Registry>,
    channel: Channel,
    poster: Poster,
    capability: RwLock<Option<Box<dyn AsyncSelect>>>,
    default_handler: Option<DefaultHandler>,
}

impl SocketManager {
    /// Returns a builder to configure a manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Initializes a manager with the default configuration.
    pub fn initialize() -> Result<Self> {
        ManagerBuilder::new().build()
    }

    pub(crate) fn initialize_with(builder: ManagerBuilder) -> Result<Self> {
        let ManagerBuilder {
            capacity,
            id_base,
            library,
            resolver,
            default_handler,
        } = builder;

        let channel = Channel::create()?;
        let registry = Registry::new(capacity, id_base);

        let capability = match resolver.resolve(library.as_deref()) {
            Ok(capability) => capability,
            Err(err) => {
                warn!(error = %err, "async-select capability could not be resolved");
                channel.destroy();
                return Err(err);
            }
        };

        debug!(capacity, id_base, "socket manager initialized");

        Ok(Self {
            registry: Mutex::new(registry),
            poster: channel.poster(),
            channel,
            capability: RwLock::new(Some(capability)),
            default_handler,
        })
    }

    /// Tears the manager down.
    ///
    /// Destroys the channel, releases the capability (stopping any
    /// backend threads) and forgets every attached socket. Idempotent;
    /// also runs on drop.
    pub fn shutdown(&self) {
        let capability = self.capability.write().take();
        if capability.is_none() {
            return;
        }

        self.channel.destroy();
        drop(capability);
        self.registry.lock().clear();

        debug!("socket manager shut down");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.capability.read().is_none()
    }

    /// Assigns `socket` a registry slot and identifier.
    ///
    /// Attaching an already attached socket returns its current id. Fails
    /// with [`Error::RegistryFull`] when no slot is free; the socket can
    /// then only be used synchronously.
    pub fn attach_socket(&self, socket: &Arc<Socket>) -> Result<SocketId> {
        if self.channel.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let mut registry = self.registry.lock();

        if let Some(id) = socket.id() {
            if owns(&registry, id, socket) {
                return Ok(id);
            }
        }

        let allocation = registry.register(socket).inspect_err(|err| {
            warn!(error = %err, "cannot attach socket");
        })?;

        if allocation.reclaimed {
            // Previous owner was dropped without being detached.
            let purged = self.channel.purge(allocation.id.tag());
            trace!(tag = allocation.id.tag(), purged, "reclaimed abandoned slot");
        }

        socket.set_id(Some(allocation.id));
        trace!(tag = allocation.id.tag(), fd = ?socket.fd(), "socket attached");

        Ok(allocation.id)
    }

    /// Releases `socket`'s slot.
    ///
    /// Queued notifications for its identifier are purged first, under
    /// the registry lock, so a socket that later reuses the slot can
    /// never see them. Only clears the socket's id if its slot belongs to
    /// another manager, and does nothing for a socket never attached.
    pub fn detach_socket(&self, socket: &Socket) {
        let mut registry = self.registry.lock();

        let Some(id) = socket.id() else {
            return;
        };

        // The id may belong to another manager's registry.
        if owns(&registry, id, socket) {
            let purged = self.channel.purge(id.tag());
            registry.release(id);
            trace!(tag = id.tag(), purged, "socket detached");
        }
        socket.set_id(None);
    }

    /// Starts readiness notifications for `socket`.
    ///
    /// Listening sockets are watched for incoming connections only;
    /// other sockets for read, write, connect and close. A socket whose
    /// descriptor was invalidated is left alone.
    pub fn enable_notifications(&self, socket: &Socket) -> Result<()> {
        let Some(fd) = socket.fd() else {
            return Ok(());
        };

        let id = socket.id().ok_or(Error::NotAttached)?;
        let mask = if socket.is_server() {
            EventMask::SERVER
        } else {
            EventMask::CLIENT
        };

        self.select(fd, id.tag(), mask)
    }

    /// Stops future readiness notifications for `socket`.
    ///
    /// Already queued notifications are not affected; they are removed
    /// when the socket is detached.
    pub fn disable_notifications(&self, socket: &Socket) -> Result<()> {
        let Some(fd) = socket.fd() else {
            return Ok(());
        };

        let tag = socket.id().map_or(0, SocketId::tag);
        self.select(fd, tag, EventMask::NONE)
    }

    fn select(&self, fd: RawFd, tag: u32, mask: EventMask) -> Result<()> {
        let capability = self.capability.read();
        let capability = capability.as_ref().ok_or(Error::ChannelClosed)?;

        capability.async_select(fd, &self.poster, tag, mask)?;
        trace!(?fd, tag, mask = mask.bits(), "async select updated");

        Ok(())
    }

    /// Handles one notification as the channel's procedure would.
    ///
    /// Tags outside the socket range go to the default handler.
    pub fn dispatch(&self, notification: Notification) -> Dispatch {
        let outcome = demultiplex(&self.registry, notification);

        match outcome {
            Dispatch::Delivered(_) => self.reenable(&notification),
            Dispatch::Unhandled => match &self.default_handler {
                Some(handler) => handler(&notification),
                None => trace!(tag = notification.tag, "foreign notification ignored"),
            },
            Dispatch::Dropped => {}
        }

        outcome
    }

    /// Lets the capability re-post a condition the callback left pending.
    fn reenable(&self, notification: &Notification) {
        let still_owned = self
            .registry
            .lock()
            .lookup(notification.tag)
            .is_some_and(|socket| socket.fd() == Some(notification.fd));
        if !still_owned {
            return;
        }

        if let Some(capability) = self.capability.read().as_ref() {
            capability.reenable(notification.fd, notification.event);
        }
    }

    /// Dispatches the notifications queued when the call starts, without
    /// blocking.
    ///
    /// Notifications posted while dispatching wait for the next call, so a
    /// condition that is re-posted on every delivery cannot trap the
    /// caller. Returns the number of notifications dispatched.
    pub fn dispatch_pending(&self) -> usize {
        self.dispatch_queued(self.channel.len())
    }

    fn dispatch_queued(&self, queued: usize) -> usize {
        let mut dispatched = 0;

        while dispatched < queued {
            let Some(notification) = self.channel.try_recv() else {
                break;
            };
            self.dispatch(notification);
            dispatched += 1;
        }

        dispatched
    }

    /// Waits up to `timeout` for a notification, then dispatches it and
    /// everything else already queued.
    ///
    /// `Duration::MAX` waits until a notification arrives or the manager
    /// shuts down. Returns the number of notifications dispatched (zero on
    /// timeout or after shutdown). Only one thread should pump a given
    /// manager.
    pub fn pump(&self, timeout: Duration) -> usize {
        let Some(first) = self.channel.recv_timeout(timeout) else {
            return 0;
        };

        let queued = self.channel.len();
        self.dispatch(first);
        1 + self.dispatch_queued(queued)
    }

    /// Sending handle for the manager's channel.
    pub fn poster(&self) -> Poster {
        self.poster.clone()
    }

    /// Notifications waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.channel.len()
    }

    /// Number of registry slots.
    pub fn capacity(&self) -> usize {
        self.registry.lock().capacity()
    }

    /// Number of attached sockets that are still alive.
    pub fn attached(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketManager")
            .field("capacity", &self.capacity())
            .field("attached", &self.attached())
            .field("pending", &self.pending())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Returns `true` if the slot behind `id` still refers to `socket`.
fn owns(registry: &Registry, id: SocketId, socket: &Socket) -> bool {
    registry
        .lookup(id.tag())
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), socket))
}
