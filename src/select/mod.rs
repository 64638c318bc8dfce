//! The async-select capability.
//!
//! An [`AsyncSelect`] arranges for future readiness of a descriptor to be
//! posted to the notification channel under a given tag. The concrete
//! implementation is discovered at runtime through a [`Resolve`] strategy
//! so the manager never links the platform primitive statically.
//!
//! The default [`SystemResolver`] picks the backend for the target OS:
//! - Linux: an edge-triggered `epoll` watcher thread that re-posts
//!   `READ`/`ACCEPT` while data or connections remain,
//! - Windows: `WSAEventSelect` watcher threads, one per socket.

pub mod library;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(windows)]
mod event_select;

use crate::channel::Poster;
use crate::error::Result;
use crate::event::EventMask;
use crate::socket::RawFd;

use std::io;

pub use library::DynamicLibrary;

/// Posts readiness of a descriptor to a notification channel.
pub trait AsyncSelect: Send + Sync {
    /// Starts posting the events in `mask` for `fd` to `poster`, each
    /// tagged with `tag`.
    ///
    /// Calling it again for the same descriptor replaces the previous
    /// request. An empty `mask` stops future notifications; anything
    /// already queued on the channel stays there.
    fn async_select(&self, fd: RawFd, poster: &Poster, tag: u32, mask: EventMask)
    -> io::Result<()>;

    /// Called after the `event` notification for `fd` was delivered.
    ///
    /// Message-based selects re-enable `READ` and `ACCEPT` once the
    /// receiver calls `recv` or `accept`, and post them again if the
    /// condition still holds. Backends whose OS primitive does not do
    /// that by itself emulate it here. The default does nothing.
    fn reenable(&self, fd: RawFd, event: u32) {
        let _ = (fd, event);
    }
}

/// Strategy used by the manager to discover its [`AsyncSelect`].
pub trait Resolve: Send + Sync {
    /// Resolves the capability, optionally from the named `library`.
    fn resolve(&self, library: Option<&str>) -> Result<Box<dyn AsyncSelect>>;
}

impl<F> Resolve for F
where
    F: Fn(Option<&str>) -> Result<Box<dyn AsyncSelect>> + Send + Sync,
{
    fn resolve(&self, library: Option<&str>) -> Result<Box<dyn AsyncSelect>> {
        self(library)
    }
}

/// Resolves the platform's native async-select backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    #[cfg(target_os = "linux")]
    fn resolve(&self, library: Option<&str>) -> Result<Box<dyn AsyncSelect>> {
        let library = match library {
            Some(name) => DynamicLibrary::open(name)?,
            None => DynamicLibrary::process()?,
        };

        Ok(Box::new(epoll::EpollSelect::new(library)?))
    }

    #[cfg(windows)]
    fn resolve(&self, library: Option<&str>) -> Result<Box<dyn AsyncSelect>> {
        let library = DynamicLibrary::open(library.unwrap_or(event_select::DEFAULT_LIBRARY))?;

        Ok(Box::new(event_select::EventSelect::new(library)?))
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn resolve(&self, _library: Option<&str>) -> Result<Box<dyn AsyncSelect>> {
        Err(crate::error::Error::CapabilityUnavailable(format!(
            "no async-select backend for {}",
            std::env::consts::OS
        )))
    }
}
