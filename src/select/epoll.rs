//! Linux `epoll`-based async-select backend.
//!
//! `epoll_create1`, `epoll_ctl` and `epoll_wait` are resolved by name from
//! a [`DynamicLibrary`]. A watcher thread blocks in `epoll_wait` and turns
//! readiness edges into channel notifications, mimicking message-based
//! socket notification:
//! - `ACCEPT` when a listening socket becomes readable,
//! - a single `CONNECT` (carrying `SO_ERROR`) when an outgoing connection
//!   completes,
//! - `READ`, `OOB` and `WRITE` on each readiness edge,
//! - a single `CLOSE` when the peer hangs up.
//!
//! Descriptors are registered edge-triggered, so an event is posted once
//! per transition rather than on every wait while the condition holds.
//! [`AsyncSelect::reenable`] posts `READ` again when the receiver drained
//! only part of the buffered data, and `ACCEPT` again while connections
//! are still queued, as `recv` and `accept` do for message-based selects.

use super::AsyncSelect;
use super::library::DynamicLibrary;
use crate::channel::{Notification, Poster};
use crate::error::Result;
use crate::event::{EventMask, NET_ACCEPT, NET_CLOSE, NET_CONNECT, NET_OOB, NET_READ, NET_WRITE};
use crate::socket::RawFd;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, ENOENT, ENOTCONN, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
    EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP, EEXIST,
    SO_ERROR, SOL_SOCKET, c_int, epoll_event, sockaddr_storage, socklen_t,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type EpollCreate1 = unsafe extern "C" fn(c_int) -> c_int;
type EpollCtl = unsafe extern "C" fn(c_int, c_int, c_int, *mut epoll_event) -> c_int;
type EpollWait = unsafe extern "C" fn(c_int, *mut epoll_event, c_int, c_int) -> c_int;

/// Token reserved for the internal wake-up eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// Events fetched per `epoll_wait` call.
const EVENT_BATCH: usize = 64;

/// What the watcher knows about one enabled descriptor.
struct Watch {
    tag: u32,
    mask: EventMask,
    poster: Poster,

    /// An outgoing connection is still in progress.
    connecting: bool,

    /// `CLOSE` (or a failed `CONNECT`) has already been posted.
    closed: bool,

    /// Bytes buffered when `READ` was last posted.
    unread: usize,
}

struct Inner {
    epoll_ctl: EpollCtl,
    epoll_wait: EpollWait,

    epoll: RawFd,
    wake: RawFd,
    running: AtomicBool,
    watches: Mutex<HashMap<RawFd, Watch>>,

    /// Keeps the resolved symbols valid; dropped last.
    _library: DynamicLibrary,
}

/// Async-select backed by an `epoll` instance and a watcher thread.
pub(crate) struct EpollSelect {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl EpollSelect {
    /// Resolves the `epoll` entry points from `library` and starts the
    /// watcher thread.
    pub(crate) fn new(library: DynamicLibrary) -> Result<Self> {
        let (epoll_create1, epoll_ctl, epoll_wait) = unsafe {
            (
                library.symbol::<EpollCreate1>("epoll_create1")?,
                library.symbol::<EpollCtl>("epoll_ctl")?,
                library.symbol::<EpollWait>("epoll_wait")?,
            )
        };

        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let wake = unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if wake < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err.into());
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, wake, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake);
                libc::close(epoll);
            }
            return Err(err.into());
        }

        let inner = Arc::new(Inner {
            epoll_ctl,
            epoll_wait,
            epoll,
            wake,
            running: AtomicBool::new(true),
            watches: Mutex::new(HashMap::new()),
            _library: library,
        });

        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("sockmux-epoll".into())
            .spawn(move || worker.run())?;

        debug!(epoll, "epoll async-select backend started");

        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }
}

impl AsyncSelect for EpollSelect {
    fn async_select(
        &self,
        fd: RawFd,
        poster: &Poster,
        tag: u32,
        mask: EventMask,
    ) -> io::Result<()> {
        let inner = &self.inner;
        let mut watches = inner.watches.lock();

        if mask.is_empty() {
            if watches.remove(&fd).is_some() {
                inner.ctl(EPOLL_CTL_DEL, fd, 0, 0).or_else(ignore(ENOENT))?;
            }
            return Ok(());
        }

        let connecting = mask.contains(EventMask::CONNECT) && !is_connected(fd);
        let flags = interest(mask);

        let op = if watches.contains_key(&fd) {
            EPOLL_CTL_MOD
        } else {
            EPOLL_CTL_ADD
        };

        // Register the watch first: with edge triggering, an event that
        // fires before the watch exists would be lost.
        let previous = watches.insert(
            fd,
            Watch {
                tag,
                mask,
                poster: poster.clone(),
                connecting,
                closed: false,
                unread: 0,
            },
        );

        // The descriptor may have been closed and reopened behind our back,
        // leaving the watch table and the epoll set out of sync.
        let result = inner
            .ctl(op, fd, flags, fd as u64)
            .or_else(|err| match err.raw_os_error() {
                Some(EEXIST) => inner.ctl(EPOLL_CTL_MOD, fd, flags, fd as u64),
                Some(ENOENT) => inner.ctl(EPOLL_CTL_ADD, fd, flags, fd as u64),
                _ => Err(err),
            });

        if let Err(err) = result {
            match previous {
                Some(previous) => watches.insert(fd, previous),
                None => watches.remove(&fd),
            };
            return Err(err);
        }

        trace!(fd, tag, mask = mask.bits(), connecting, "descriptor armed");
        Ok(())
    }

    fn reenable(&self, fd: RawFd, event: u32) {
        let (poster, notification) = {
            let mut watches = self.inner.watches.lock();
            // Buffered data outlives a hang-up; closed watches still count.
            let Some(watch) = watches.get_mut(&fd) else {
                return;
            };

            match event {
                NET_READ if watch.mask.contains(EventMask::READ) => {
                    let left = available(fd);
                    if left == 0 {
                        watch.unread = 0;
                        return;
                    }
                    // Nothing was consumed: the next arrival raises an edge.
                    if left >= watch.unread {
                        return;
                    }

                    watch.unread = left;
                    (watch.poster.clone(), Notification::new(watch.tag, fd, NET_READ))
                }
                NET_ACCEPT if watch.mask.contains(EventMask::ACCEPT) && readable(fd) => {
                    (watch.poster.clone(), Notification::new(watch.tag, fd, NET_ACCEPT))
                }
                _ => return,
            }
        };

        trace!(fd, tag = notification.tag, event, "condition still pending, re-posted");
        if poster.post(notification).is_err() {
            trace!(tag = notification.tag, "channel closed, notification discarded");
        }
    }
}

impl Drop for EpollSelect {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wake();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("epoll watcher thread panicked");
            }
        }

        debug!("epoll async-select backend stopped");
    }
}

impl Inner {
    fn ctl(&self, op: c_int, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };

        let rc = unsafe { (self.epoll_ctl)(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.wake, &buf as *const _ as *const _, 8);
        }
    }

    fn drain_wake(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.wake, &mut buf as *mut _ as *mut _, 8);
        }
    }

    fn run(&self) {
        let mut events: Vec<epoll_event> = Vec::with_capacity(EVENT_BATCH);
        let mut pending: Vec<(Poster, Notification)> = Vec::new();

        while self.running.load(Ordering::Acquire) {
            let n = unsafe {
                (self.epoll_wait)(self.epoll, events.as_mut_ptr(), EVENT_BATCH as c_int, -1)
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "epoll_wait failed, watcher exiting");
                return;
            }

            unsafe { events.set_len(n as usize) };

            {
                let mut watches = self.watches.lock();
                for event in events.iter() {
                    let token = event.u64;
                    let ready = event.events;

                    if token == WAKE_TOKEN {
                        self.drain_wake();
                        continue;
                    }

                    let fd = token as RawFd;
                    if let Some(watch) = watches.get_mut(&fd) {
                        translate(fd, ready, watch, &mut pending);
                    }
                }
            }

            unsafe { events.set_len(0) };

            // Post outside the watch lock so a full or closed channel never
            // holds up async_select callers.
            for (poster, notification) in pending.drain(..) {
                if poster.post(notification).is_err() {
                    trace!(tag = notification.tag, "channel closed, notification discarded");
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake);
            libc::close(self.epoll);
        }
    }
}

/// Converts one readiness report into notifications for `watch`.
fn translate(fd: RawFd, ready: u32, watch: &mut Watch, out: &mut Vec<(Poster, Notification)>) {
    if watch.closed {
        return;
    }

    let tag = watch.tag;
    let poster = watch.poster.clone();
    let has = |bits: c_int| ready & bits as u32 != 0;
    let mut push = |event: u32, error: u16| {
        out.push((
            poster.clone(),
            Notification::new(tag, fd, event).with_error(error),
        ));
    };

    if watch.mask.contains(EventMask::ACCEPT) && has(EPOLLIN) {
        push(NET_ACCEPT, 0);
    }

    if watch.connecting {
        // An unconnected socket reports OUT|HUP as soon as it is added,
        // before connect() was even issued; only a peer or a pending
        // error settles the attempt.
        if !has(EPOLLOUT | EPOLLERR | EPOLLHUP) {
            return;
        }

        let error = socket_error(fd);
        if error != 0 {
            watch.connecting = false;
            watch.closed = true;
            push(NET_CONNECT, error);
            return;
        }

        if !is_connected(fd) {
            return;
        }

        watch.connecting = false;
        push(NET_CONNECT, 0);
    }

    if watch.mask.contains(EventMask::READ) && has(EPOLLIN) {
        watch.unread = available(fd);
        push(NET_READ, 0);
    }

    if watch.mask.contains(EventMask::OOB) && has(EPOLLPRI) {
        push(NET_OOB, 0);
    }

    if watch.mask.contains(EventMask::WRITE) && has(EPOLLOUT) {
        push(NET_WRITE, 0);
    }

    if watch.mask.contains(EventMask::CLOSE) && has(EPOLLRDHUP | EPOLLHUP | EPOLLERR) {
        watch.closed = true;
        push(NET_CLOSE, 0);
    }
}

/// `epoll` interest flags for a request mask.
fn interest(mask: EventMask) -> u32 {
    let mut flags = EPOLLET;

    if mask.contains(EventMask::READ) || mask.contains(EventMask::ACCEPT) {
        flags |= EPOLLIN;
    }
    if mask.contains(EventMask::WRITE) || mask.contains(EventMask::CONNECT) {
        flags |= EPOLLOUT;
    }
    if mask.contains(EventMask::OOB) {
        flags |= EPOLLPRI;
    }
    if mask.contains(EventMask::CLOSE) {
        flags |= EPOLLRDHUP;
    }

    flags as u32
}

/// Bytes waiting in the receive buffer; zero when unknown.
fn available(fd: RawFd) -> usize {
    let mut count: c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if rc < 0 { 0 } else { count.max(0) as usize }
}

/// Returns `true` if a read (or accept) would not block right now.
fn readable(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
    rc > 0 && pollfd.revents & libc::POLLIN != 0
}

/// Returns `false` while the socket has no peer yet.
fn is_connected(fd: RawFd) -> bool {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut _, &mut len) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(ENOTCONN)
}

/// Pending `SO_ERROR` of a socket, clamped to the notification's width.
fn socket_error(fd: RawFd) -> u16 {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut value as *mut _ as *mut _,
            &mut len,
        )
    };

    let code = if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(-1)
    } else {
        value
    };

    code.clamp(0, u16::MAX as c_int) as u16
}

fn ignore(code: c_int) -> impl FnOnce(io::Error) -> io::Result<()> {
    move |err| {
        if err.raw_os_error() == Some(code) {
            Ok(())
        } else {
            Err(err)
        }
    }
}
