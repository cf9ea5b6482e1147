//! String interning table.
//!
//! Open-addressed map from a string payload to the stream offset where the
//! encoder first wrote it, with a per-entry "used as key" flag. Entries own
//! a copy of the payload bytes (only out-of-line strings are interned, so
//! every entry has a stable stream location to point back to).

use crate::hash::hash32;

/// Where an interned string lives in the stream, and how it has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringInfo {
    /// Stream offset of the string value's first byte.
    pub offset: u32,
    /// Whether any occurrence was written as a dictionary key.
    pub used_as_key: bool,
}

#[derive(Debug)]
struct Entry {
    bytes: Box<[u8]>,
    info: StringInfo,
}

/// Result of a [`StringTable::find`]: a hit, or the slot to insert at.
///
/// A `Vacant` slot is invalidated by any subsequent insertion.
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    Found(usize),
    Vacant(usize),
}

/// Open-addressed hash table with linear probing.
#[derive(Debug)]
pub struct StringTable {
    slots: Vec<Option<Entry>>,
    count: usize,
}

impl StringTable {
    /// Create a table sized for roughly `n` entries.
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        let size = (n.max(8) * 2).next_power_of_two();
        Self {
            slots: (0..size).map(|_| None).collect(),
            count: 0,
        }
    }

    /// Number of interned strings.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check whether the table holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Look up `key`, returning either its slot or an empty slot where it
    /// may be inserted with [`add_at`](StringTable::add_at).
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Slot {
        let mask = self.slots.len() - 1;
        let mut i = hash32(key) as usize & mask;
        loop {
            match &self.slots[i] {
                Some(entry) if &*entry.bytes == key => return Slot::Found(i),
                Some(_) => i = (i + 1) & mask,
                None => return Slot::Vacant(i),
            }
        }
    }

    /// Insert `key` at a vacant slot previously returned by `find`.
    pub fn add_at(&mut self, slot: Slot, key: &[u8], info: StringInfo) {
        let Slot::Vacant(i) = slot else {
            debug_assert!(false, "add_at needs a vacant slot");
            return;
        };
        debug_assert!(self.slots[i].is_none());
        self.slots[i] = Some(Entry {
            bytes: key.into(),
            info,
        });
        self.count += 1;
        if self.count * 4 >= self.slots.len() * 3 {
            self.grow();
        }
    }

    /// Stream info for the entry at `slot` (must be occupied).
    #[must_use]
    pub fn info(&self, slot: usize) -> &StringInfo {
        &self.slots[slot].as_ref().expect("occupied slot").info
    }

    /// Mutable stream info for the entry at `slot` (must be occupied).
    pub fn info_mut(&mut self, slot: usize) -> &mut StringInfo {
        &mut self.slots[slot].as_mut().expect("occupied slot").info
    }

    /// Iterate over occupied entries, in table order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a [u8], &'a StringInfo)> + 'a {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| (&*e.bytes, &e.info)))
    }

    /// Iterate over every slot, in table order. Empty slots yield `None`.
    pub fn slots<'a>(
        &'a self,
    ) -> impl Iterator<Item = Option<(&'a [u8], &'a StringInfo)>> + 'a {
        self.slots
            .iter()
            .map(|s| s.as_ref().map(|e| (&*e.bytes, &e.info)))
    }

    /// Remove every entry, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.count = 0;
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, (0..new_len).map(|_| None).collect());
        let mask = self.slots.len() - 1;
        for entry in old.into_iter().flatten() {
            let mut i = hash32(&entry.bytes) as usize & mask;
            while self.slots[i].is_some() {
                i = (i + 1) & mask;
            }
            self.slots[i] = Some(entry);
        }
    }
}
