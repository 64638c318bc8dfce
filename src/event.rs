//! Event kinds, detected-state bitmasks and low-level request masks.
//!
//! Two vocabularies live here:
//! - [`SocketEvent`] / [`EventFlags`]: the abstract kinds a socket owner
//!   cares about (input, output, connection, lost),
//! - [`EventMask`] and the raw network-event codes: what the OS layer
//!   reports and what the async-select capability is asked to watch.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Raw network-event code: data is available to read.
pub const NET_READ: u32 = 0x01;
/// Raw network-event code: the socket accepts more outgoing data.
pub const NET_WRITE: u32 = 0x02;
/// Raw network-event code: out-of-band data arrived.
pub const NET_OOB: u32 = 0x04;
/// Raw network-event code: a listening socket has a pending connection.
pub const NET_ACCEPT: u32 = 0x08;
/// Raw network-event code: an outgoing connection attempt completed.
pub const NET_CONNECT: u32 = 0x10;
/// Raw network-event code: the peer closed the connection.
pub const NET_CLOSE: u32 = 0x20;

/// Abstract state change delivered to a socket's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    /// Data can be read.
    Input,
    /// Data can be written.
    Output,
    /// An incoming connection is pending, or an outgoing one succeeded.
    Connection,
    /// The connection is gone (closed by the peer or failed to connect).
    Lost,
}

impl SocketEvent {
    /// Bit position of this kind inside [`EventFlags`].
    pub const fn bit(self) -> u32 {
        match self {
            SocketEvent::Input => 0,
            SocketEvent::Output => 1,
            SocketEvent::Connection => 2,
            SocketEvent::Lost => 3,
        }
    }

    /// Maps a raw network-event code to an abstract kind.
    ///
    /// `error` is only consulted for [`NET_CONNECT`]: a failed connection
    /// attempt is reported as [`SocketEvent::Lost`]. Codes without an
    /// abstract counterpart (including [`NET_OOB`]) yield `None`.
    pub fn classify(code: u32, error: u16) -> Option<Self> {
        match code {
            NET_READ => Some(SocketEvent::Input),
            NET_WRITE => Some(SocketEvent::Output),
            NET_ACCEPT => Some(SocketEvent::Connection),
            NET_CONNECT if error != 0 => Some(SocketEvent::Lost),
            NET_CONNECT => Some(SocketEvent::Connection),
            NET_CLOSE => Some(SocketEvent::Lost),
            _ => None,
        }
    }
}

/// Accumulated set of detected [`SocketEvent`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    /// No event detected.
    pub const EMPTY: Self = Self(0);
    /// Data can be read.
    pub const INPUT: Self = Self::of(SocketEvent::Input);
    /// Data can be written.
    pub const OUTPUT: Self = Self::of(SocketEvent::Output);
    /// A connection was accepted or established.
    pub const CONNECTION: Self = Self::of(SocketEvent::Connection);
    /// The connection is gone.
    pub const LOST: Self = Self::of(SocketEvent::Lost);

    /// Flag set containing only `event`.
    pub const fn of(event: SocketEvent) -> Self {
        Self(1 << event.bit())
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no event is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every flag in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Folds a newly detected event into the set.
    ///
    /// `Lost` replaces everything; once the connection is gone no other
    /// readiness matters. Any other kind is OR'ed in.
    pub fn record(&mut self, event: SocketEvent) {
        if event == SocketEvent::Lost {
            *self = Self::LOST;
        } else {
            *self |= Self::of(event);
        }
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for EventFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & 0b1111)
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::INPUT, "INPUT"),
            (Self::OUTPUT, "OUTPUT"),
            (Self::CONNECTION, "CONNECTION"),
            (Self::LOST, "LOST"),
        ];

        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            write!(f, "EventFlags(EMPTY)")
        } else {
            write!(f, "EventFlags({})", set.join(" | "))
        }
    }
}

/// Set of raw network events the capability should watch for a socket.
///
/// An empty mask cancels notifications for the descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    /// Requests nothing; disables notifications.
    pub const NONE: Self = Self(0);
    /// Incoming data.
    pub const READ: Self = Self(NET_READ);
    /// Room in the send buffer.
    pub const WRITE: Self = Self(NET_WRITE);
    /// Out-of-band data.
    pub const OOB: Self = Self(NET_OOB);
    /// A pending incoming connection.
    pub const ACCEPT: Self = Self(NET_ACCEPT);
    /// Completion of an outgoing connect.
    pub const CONNECT: Self = Self(NET_CONNECT);
    /// The peer closed the connection.
    pub const CLOSE: Self = Self(NET_CLOSE);

    /// Mask requested for listening sockets.
    pub const SERVER: Self = Self::ACCEPT;

    /// Mask requested for connected or connecting sockets.
    pub const CLIENT: Self = Self(NET_READ | NET_WRITE | NET_CONNECT | NET_CLOSE);

    /// Builds a mask from raw `NET_*` bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw `NET_*` bits, as handed to the OS primitive.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if nothing is requested.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every event in `other` is requested.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
