use crate::channel::Notification;
use crate::error::Result;
use crate::manager::SocketManager;
use crate::select::{Resolve, SystemResolver};

use std::fmt;
use std::sync::Arc;

/// Default number of registry slots.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default identifier of the first slot (the first user message number).
pub const DEFAULT_ID_BASE: u32 = 0x0400;

/// Highest identifier a slot may map to.
pub const MAX_TAG: u32 = 0x7FFF;

/// Handler for notifications whose tag is outside the socket range.
pub type DefaultHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Builder for configuring and initializing a [`SocketManager`].
///
/// # Examples
///
/// ```rust,ignore
/// let manager = SocketManager::builder()
///     .capacity(256)
///     .build()?;
/// ```
pub struct ManagerBuilder {
    /// Number of registry slots.
    pub(crate) capacity: usize,

    /// Identifier of slot 0.
    pub(crate) id_base: u32,

    /// Library the capability is resolved from, if not the platform default.
    pub(crate) library: Option<String>,

    /// Capability discovery strategy.
    pub(crate) resolver: Box<dyn Resolve>,

    /// Receives notifications with foreign tags.
    pub(crate) default_handler: Option<DefaultHandler>,
}

impl ManagerBuilder {
    /// Creates a builder with 1024 slots starting at tag `0x0400` and the
    /// platform's [`SystemResolver`].
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            id_base: DEFAULT_ID_BASE,
            library: None,
            resolver: Box::new(SystemResolver),
            default_handler: None,
        }
    }

    /// Sets the number of registry slots.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "capacity must be > 0");

        self.capacity = n;
        self
    }

    /// Sets the identifier assigned to the first slot.
    ///
    /// # Panics
    ///
    /// Panics if `base == 0`; zero means "unassigned".
    pub fn id_base(mut self, base: u32) -> Self {
        assert!(base > 0, "id_base must be > 0");

        self.id_base = base;
        self
    }

    /// Resolves the capability from `name` instead of the platform default.
    pub fn library(mut self, name: impl Into<String>) -> Self {
        self.library = Some(name.into());
        self
    }

    /// Replaces the capability discovery strategy.
    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Installs a handler for notifications outside the socket tag range.
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Initializes the manager with the configured options.
    ///
    /// # Panics
    ///
    /// Panics if the identifier range `id_base..id_base + capacity` does
    /// not fit below [`MAX_TAG`].
    pub fn build(self) -> Result<SocketManager> {
        let last = self.id_base as u64 + self.capacity as u64 - 1;
        assert!(
            last <= MAX_TAG as u64,
            "identifier range {:#x}..={:#x} exceeds {:#x}",
            self.id_base,
            last,
            MAX_TAG
        );

        SocketManager::initialize_with(self)
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("capacity", &self.capacity)
            .field("id_base", &self.id_base)
            .field("library", &self.library)
            .field("default_handler", &self.default_handler.is_some())
            .finish_non_exhaustive()
    }
}
