use crate::error::{Error, Result};
use crate::socket::{Socket, SocketId};

use std::sync::{Arc, Weak};

/// Outcome of a successful [`Registry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    /// Identifier assigned to the socket.
    pub(crate) id: SocketId,

    /// The slot previously belonged to a socket that was dropped without
    /// being detached. The caller must purge the tag before using it.
    pub(crate) reclaimed: bool,
}

/// Fixed-capacity table of non-owning socket references.
///
/// Each slot maps to one identifier (`slot + base`). Slots are handed out
/// round-robin starting at a rotating cursor, so a released identifier is
/// reused as late as possible.
///
/// The registry does no locking of its own: the manager wraps it in the
/// single mutex that also covers channel purges and dispatch lookups.
pub(crate) struct Registry {
    /// Weak references to the attached sockets.
    slots: Box<[Option<Weak<Socket>>]>,

    /// Next slot to probe.
    cursor: usize,

    /// Identifier of slot 0.
    base: u32,
}

impl Registry {
    /// Creates an all-empty registry with the cursor at slot 0.
    pub(crate) fn new(capacity: usize, base: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursor: 0,
            base,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots whose socket is still alive.
    ///
    /// A socket dropped without being detached stops counting at once,
    /// even though its slot is only reclaimed by a later `register`.
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns `true` if `tag` lies in this registry's identifier range.
    pub(crate) fn is_valid(&self, tag: u32) -> bool {
        self.slot_of(tag).is_some()
    }

    /// Assigns a free slot to `socket`.
    ///
    /// Scans from the cursor and wraps around once. Fails with
    /// [`Error::RegistryFull`] when every slot holds a live socket.
    pub(crate) fn register(&mut self, socket: &Arc<Socket>) -> Result<Allocation> {
        let capacity = self.capacity();
        let start = self.cursor;
        let mut index = start;

        loop {
            let reclaimed = match &self.slots[index] {
                None => Some(false),
                Some(weak) if weak.strong_count() == 0 => Some(true),
                Some(_) => None,
            };

            if let Some(reclaimed) = reclaimed {
                self.slots[index] = Some(Arc::downgrade(socket));
                self.cursor = (index + 1) % capacity;

                return Ok(Allocation {
                    id: SocketId::new(self.base + index as u32),
                    reclaimed,
                });
            }

            index = (index + 1) % capacity;
            if index == start {
                return Err(Error::RegistryFull { capacity });
            }
        }
    }

    /// Empties the slot behind `id`. Unknown identifiers are ignored.
    pub(crate) fn release(&mut self, id: SocketId) {
        if let Some(slot) = self.slot_of(id.tag()) {
            self.slots[slot] = None;
        }
    }

    /// Returns the live socket registered under `tag`.
    pub(crate) fn lookup(&self, tag: u32) -> Option<Arc<Socket>> {
        let slot = self.slot_of(tag)?;
        self.slots[slot].as_ref()?.upgrade()
    }

    /// Drops every reference and resets the cursor.
    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.cursor = 0;
    }

    fn slot_of(&self, tag: u32) -> Option<usize> {
        let slot = tag.checked_sub(self.base)? as usize;
        (slot < self.slots.len()).then_some(slot)
    }
}
