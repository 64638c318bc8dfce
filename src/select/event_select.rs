//! Windows `WSAEventSelect`-based async-select backend.
//!
//! Each enabled socket gets a WSA event object and a watcher thread that
//! waits on it, enumerates the reported network events and posts one
//! notification per event to the channel. The WinSock entry points are
//! resolved from `ws2_32.dll` at runtime.

use super::AsyncSelect;
use super::library::DynamicLibrary;
use crate::channel::{Notification, Poster};
use crate::error::Result;
use crate::event::{EventMask, NET_ACCEPT, NET_CLOSE, NET_CONNECT, NET_OOB, NET_READ, NET_WRITE};
use crate::socket::RawFd;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};
use windows_sys::Win32::Networking::WinSock::SOCKET;

/// Module the WinSock 2 entry points are loaded from by default.
pub(crate) const DEFAULT_LIBRARY: &str = "ws2_32.dll";

const WSA_INFINITE: u32 = u32::MAX;
const WSA_WAIT_FAILED: u32 = u32::MAX;

/// `FD_*` bit index → raw network-event code.
const NETWORK_EVENTS: [(usize, u32); 6] = [
    (0, NET_READ),
    (1, NET_WRITE),
    (2, NET_OOB),
    (3, NET_ACCEPT),
    (4, NET_CONNECT),
    (5, NET_CLOSE),
];

#[repr(C)]
#[derive(Default)]
struct NetworkEvents {
    network_events: i32,
    error_codes: [i32; 10],
}

type WsaCreateEvent = unsafe extern "system" fn() -> *mut c_void;
type WsaCloseEvent = unsafe extern "system" fn(*mut c_void) -> i32;
type WsaSetEvent = unsafe extern "system" fn(*mut c_void) -> i32;
type WsaEventSelect = unsafe extern "system" fn(SOCKET, *mut c_void, i32) -> i32;
type WsaWaitForMultipleEvents =
    unsafe extern "system" fn(u32, *const *mut c_void, i32, u32, i32) -> u32;
type WsaEnumNetworkEvents =
    unsafe extern "system" fn(SOCKET, *mut c_void, *mut NetworkEvents) -> i32;

struct WinSock {
    create_event: WsaCreateEvent,
    close_event: WsaCloseEvent,
    set_event: WsaSetEvent,
    event_select: WsaEventSelect,
    wait: WsaWaitForMultipleEvents,
    enum_events: WsaEnumNetworkEvents,

    _library: DynamicLibrary,
}

/// A WSA event object handle.
#[derive(Clone, Copy)]
struct EventHandle(*mut c_void);

unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

/// A running watcher for one socket.
struct Watcher {
    stop: Arc<AtomicBool>,
    event: EventHandle,
    thread: JoinHandle<()>,
}

/// Async-select backed by `WSAEventSelect` and one thread per socket.
pub(crate) struct EventSelect {
    winsock: Arc<WinSock>,
    watchers: Mutex<HashMap<RawFd, Watcher>>,
}

impl EventSelect {
    pub(crate) fn new(library: DynamicLibrary) -> Result<Self> {
        let winsock = unsafe {
            WinSock {
                create_event: library.symbol("WSACreateEvent")?,
                close_event: library.symbol("WSACloseEvent")?,
                set_event: library.symbol("WSASetEvent")?,
                event_select: library.symbol("WSAEventSelect")?,
                wait: library.symbol("WSAWaitForMultipleEvents")?,
                enum_events: library.symbol("WSAEnumNetworkEvents")?,
                _library: library,
            }
        };

        debug!("WSAEventSelect async-select backend resolved");

        Ok(Self {
            winsock: Arc::new(winsock),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Stops `watcher` and releases its event object.
    ///
    /// The watcher thread never closes the event itself, so the handle is
    /// valid here even when the thread already exited on its own.
    fn stop(&self, fd: RawFd, watcher: Watcher) {
        watcher.stop.store(true, Ordering::Release);
        unsafe { (self.winsock.set_event)(watcher.event.0) };

        if watcher.thread.join().is_err() {
            warn!("socket watcher thread panicked");
        }

        unsafe {
            (self.winsock.event_select)(fd as SOCKET, watcher.event.0, 0);
            (self.winsock.close_event)(watcher.event.0);
        }
    }
}

impl AsyncSelect for EventSelect {
    fn async_select(
        &self,
        fd: RawFd,
        poster: &Poster,
        tag: u32,
        mask: EventMask,
    ) -> io::Result<()> {
        let mut watchers = self.watchers.lock();

        if let Some(previous) = watchers.remove(&fd) {
            self.stop(fd, previous);
        }

        if mask.is_empty() {
            return Ok(());
        }

        let winsock = &self.winsock;
        let event = EventHandle(unsafe { (winsock.create_event)() });
        if event.0.is_null() {
            return Err(io::Error::last_os_error());
        }

        if unsafe { (winsock.event_select)(fd as SOCKET, event.0, mask.bits() as i32) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { (winsock.close_event)(event.0) };
            return Err(err);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let winsock = winsock.clone();
            let stop = stop.clone();
            let poster = poster.clone();

            thread::Builder::new()
                .name(format!("sockmux-wsa-{tag:#06x}"))
                .spawn(move || watch(&winsock, fd, tag, event, &stop, &poster))
        };

        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                unsafe {
                    (winsock.event_select)(fd as SOCKET, event.0, 0);
                    (winsock.close_event)(event.0);
                }
                return Err(err);
            }
        };

        watchers.insert(
            fd,
            Watcher {
                stop,
                event,
                thread,
            },
        );

        trace!(fd, tag, mask = mask.bits(), "socket watcher started");
        Ok(())
    }
}

impl Drop for EventSelect {
    fn drop(&mut self) {
        let watchers: Vec<(RawFd, Watcher)> = self.watchers.lock().drain().collect();
        for (fd, watcher) in watchers {
            self.stop(fd, watcher);
        }

        debug!("WSAEventSelect async-select backend stopped");
    }
}

/// Watcher thread body: waits on `event` until asked to stop or the
/// channel closes. The event is left open for [`EventSelect::stop`].
fn watch(
    winsock: &WinSock,
    fd: RawFd,
    tag: u32,
    event: EventHandle,
    stop: &AtomicBool,
    poster: &Poster,
) {
    loop {
        let rc = unsafe { (winsock.wait)(1, &event.0, 0, WSA_INFINITE, 0) };
        if stop.load(Ordering::Acquire) {
            break;
        }

        if rc == WSA_WAIT_FAILED {
            warn!(fd, tag, error = %io::Error::last_os_error(), "WSAWaitForMultipleEvents failed");
            break;
        }

        let mut events = NetworkEvents::default();
        if unsafe { (winsock.enum_events)(fd as SOCKET, event.0, &mut events) } != 0 {
            warn!(fd, tag, error = %io::Error::last_os_error(), "WSAEnumNetworkEvents failed");
            break;
        }

        for (bit, code) in NETWORK_EVENTS {
            if events.network_events as u32 & code == 0 {
                continue;
            }

            let error = events.error_codes[bit].clamp(0, u16::MAX as i32) as u16;
            let notification = Notification::new(tag, fd, code).with_error(error);

            if poster.post(notification).is_err() {
                trace!(tag, "channel closed, watcher exiting");
                stop.store(true, Ordering::Release);
                break;
            }
        }

        if stop.load(Ordering::Acquire) {
            break;
        }
    }
}
