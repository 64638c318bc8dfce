//! Error type shared by the registry, channel and lifecycle manager.

use std::io;

use thiserror::Error;

/// Errors reported by `sockmux`.
///
/// Every failure is a local return value; nothing in the crate aborts
/// the process on a runtime error.
#[derive(Debug, Error)]
pub enum Error {
    /// Every registry slot is occupied.
    ///
    /// The socket can still be used synchronously, it just cannot
    /// receive event-driven notifications.
    #[error("socket registry is full ({capacity} slots in use)")]
    RegistryFull {
        /// Number of slots in the registry.
        capacity: usize,
    },

    /// The socket has no identifier assigned yet.
    #[error("socket is not attached to the manager")]
    NotAttached,

    /// The notification channel has been destroyed.
    #[error("notification channel is closed")]
    ChannelClosed,

    /// The platform async-select capability could not be resolved.
    #[error("async-select capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// A shared library or one of its symbols could not be loaded.
    #[error("failed to load `{symbol}` from {library}: {reason}")]
    Library {
        /// Library that was searched.
        library: String,
        /// Symbol that was requested, or empty when the library itself failed.
        symbol: String,
        /// Loader diagnostic.
        reason: String,
    },

    /// An OS call made by a backend failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
