//! Fixed-capacity ring of the dumps kept on the receiver.
//!
//! The ring decides eviction order: inserting into a full ring hands back the
//! oldest identifier, which the sender then deletes remotely. Nothing here is
//! persisted; on restart the ring is rebuilt from the remote listing.

use crate::dump::DumpIdentifier;
use crate::error::ConfigError;

/// Hard ceiling on retained dumps, whatever the configuration asks for.
pub const MAX_RETENTION: usize = 31;

#[derive(Debug, Clone)]
pub struct RetentionBuffer {
    slots: Vec<Option<DumpIdentifier>>,
    // next slot to write
    head: usize,
    // oldest occupied slot
    tail: usize,
    len: usize,
}

impl RetentionBuffer {
    /// Create an empty ring. Capacity is clamped to [`MAX_RETENTION`]; zero is
    /// a configuration error.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "sender.max_backups",
                reason: "retention capacity must be at least 1".to_string(),
            });
        }
        let capacity = capacity.min(MAX_RETENTION);

        Ok(Self {
            slots: vec![None; capacity],
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    /// Create a ring seeded with `existing` (sorted oldest first).
    ///
    /// Returns the ring and every identifier that fell off while seeding, in
    /// eviction order.
    pub fn initialize(
        capacity: usize,
        existing: impl IntoIterator<Item = DumpIdentifier>,
    ) -> Result<(Self, Vec<DumpIdentifier>), ConfigError> {
        let mut ring = Self::new(capacity)?;
        let overflow = existing
            .into_iter()
            .filter_map(|id| ring.insert(id))
            .collect();
        Ok((ring, overflow))
    }

    /// Insert a new identifier. Returns the previous occupant of the slot,
    /// which is the oldest entry once the ring is full.
    pub fn insert(&mut self, id: DumpIdentifier) -> Option<DumpIdentifier> {
        let capacity = self.capacity();
        let evicted = self.slots[self.head].replace(id);
        self.head = (self.head + 1) % capacity;

        if self.len < capacity {
            self.len += 1;
        } else {
            // Full: head and tail now point at the same (oldest) slot.
            self.tail = self.head;
        }

        evicted
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Oldest retained identifier.
    pub fn oldest(&self) -> Option<&DumpIdentifier> {
        self.slots[self.tail].as_ref()
    }

    /// Most recently inserted identifier.
    pub fn newest(&self) -> Option<&DumpIdentifier> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.capacity();
        self.slots[(self.head + capacity - 1) % capacity].as_ref()
    }

    pub fn contains(&self, id: &DumpIdentifier) -> bool {
        self.iter().any(|held| held == id)
    }

    /// Retained identifiers, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DumpIdentifier> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.tail + i) % capacity].as_ref())
    }
}
