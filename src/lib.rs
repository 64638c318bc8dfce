//! # sockmux
//!
//! **sockmux** delivers socket readiness as tagged notifications on a single
//! channel, the way a GUI toolkit turns socket events into window messages
//! for its event loop.
//!
//! Each attached socket receives a small numeric identifier from a
//! fixed-capacity registry. The platform's async-select primitive, resolved
//! at runtime, posts readiness for the socket's descriptor to the channel
//! under that identifier. One dispatch thread drains the channel, resolves
//! each identifier back to its socket, updates the socket's detected-event
//! state and invokes its callback.
//!
//! - A **fixed-capacity registry** with round-robin identifier reuse
//! - A **single FIFO channel** with purge-on-detach, so a reused identifier
//!   never receives its previous owner's notifications
//! - A **descriptor check** at dispatch that drops stale notifications the
//!   purge could not catch
//! - A **pluggable capability**: `epoll` on Linux, `WSAEventSelect` on
//!   Windows, or any [`Resolve`] implementation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sockmux::{Socket, SocketEvent, SocketManager};
//! use std::net::TcpListener;
//! use std::os::fd::AsRawFd;
//! use std::time::Duration;
//!
//! let manager = SocketManager::initialize()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//! let socket = Socket::server(listener.as_raw_fd());
//! socket.on_state_change(|event| println!("listener: {event:?}"));
//!
//! manager.attach_socket(&socket)?;
//! manager.enable_notifications(&socket)?;
//!
//! loop {
//!     manager.pump(Duration::from_millis(100));
//! }
//! ```
//!
//! ## Modules
//!
//! - [`channel`] — The notification queue and its sending handle
//! - [`event`] — Event kinds, detected flags and request masks
//! - [`select`] — The async-select capability and its discovery

mod builder;
mod demux;
mod error;
mod manager;
mod registry;
mod socket;

pub mod channel;
pub mod event;
pub mod select;

pub use builder::{DEFAULT_CAPACITY, DEFAULT_ID_BASE, DefaultHandler, MAX_TAG, ManagerBuilder};
pub use channel::{Notification, Poster};
pub use demux::Dispatch;
pub use error::{Error, Result};
pub use event::{EventFlags, EventMask, SocketEvent};
pub use manager::SocketManager;
pub use select::{AsyncSelect, Resolve, SystemResolver};
pub use socket::{RawFd, Role, Socket, SocketId, StateCallback};
