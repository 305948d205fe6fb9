//! Fixed-size arena of context slots
//!
//! Sessions live in the arena at the index of their context row. A slot is
//! handed out again only after its occupant has been removed.

use seqloop_proto::SeqSlot;

/// Arena of `capacity` slots with a free list
#[derive(Debug)]
pub struct SlotArena<T> {
    entries: Vec<Option<T>>,
    free: Vec<SeqSlot>,
}

impl<T> SlotArena<T> {
    /// Create an arena with every slot free
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            // Popped from the back, so the lowest slot is handed out first.
            free: (0..capacity as u32).rev().map(SeqSlot).collect(),
        }
    }

    /// Occupy a free slot with the value built by `make`
    ///
    /// Returns `None` when every slot is taken.
    pub fn insert_with(&mut self, make: impl FnOnce(SeqSlot) -> T) -> Option<SeqSlot> {
        let slot = self.free.pop()?;
        self.entries[slot.index()] = Some(make(slot));
        Some(slot)
    }

    /// Vacate `slot` and return its occupant
    pub fn remove(&mut self, slot: SeqSlot) -> Option<T> {
        let value = self.entries.get_mut(slot.index())?.take()?;
        self.free.push(slot);
        Some(value)
    }

    pub fn get(&self, slot: SeqSlot) -> Option<&T> {
        self.entries.get(slot.index())?.as_ref()
    }

    pub fn get_mut(&mut self, slot: SeqSlot) -> Option<&mut T> {
        self.entries.get_mut(slot.index())?.as_mut()
    }

    /// Occupied slots with their values, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SeqSlot, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| entry.as_ref().map(|v| (SeqSlot(i as u32), v)))
    }

    /// Occupied slots with mutable values, in slot order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SeqSlot, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| entry.as_mut().map(|v| (SeqSlot(i as u32), v)))
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
