//! In-memory Hash Array Mapped Trie.
//!
//! A 64-way trie keyed on 6-bit slices of a 32-bit hash, consumed low to
//! high. Each interior node holds a 64-bit occupancy bitmap and a packed
//! child array; the child for slice `i` sits at index
//! `popcount(bitmap & ((1 << i) - 1))`. The companion index for encoded
//! dictionaries: keys hash with the same convention as the encoder's string
//! table ([`hash32`](crate::hash::hash32)), and values are typically
//! offsets into an encoded stream.

use std::fmt;

use crate::hash::hash32;

const BIT_SHIFT: u32 = 6;
const MAX_CHILDREN: usize = 1 << BIT_SHIFT;

/// Key contract: equality plus a 32-bit hash.
pub trait HamtKey: Eq {
    /// The key's 32-bit hash code.
    fn hash_code(&self) -> u32;
}

impl HamtKey for Vec<u8> {
    fn hash_code(&self) -> u32 {
        hash32(self)
    }
}

impl HamtKey for String {
    fn hash_code(&self) -> u32 {
        hash32(self.as_bytes())
    }
}

impl HamtKey for &str {
    fn hash_code(&self) -> u32 {
        hash32(self.as_bytes())
    }
}

impl HamtKey for &[u8] {
    fn hash_code(&self) -> u32 {
        hash32(self)
    }
}

impl HamtKey for u64 {
    fn hash_code(&self) -> u32 {
        hash32(&self.to_le_bytes())
    }
}

impl HamtKey for u32 {
    fn hash_code(&self) -> u32 {
        hash32(&self.to_le_bytes())
    }
}

struct Leaf<K, V> {
    hash: u32,
    key: K,
    value: V,
}

enum Child<K, V> {
    Leaf(Leaf<K, V>),
    Node(Interior<K, V>),
}

#[inline]
fn bit_number(hash: u32, shift: u32) -> u32 {
    (hash >> shift) & (MAX_CHILDREN as u32 - 1)
}

/// Starting child capacity for a node born at `level` (shift / 6): nodes
/// near the root see more traffic and start larger.
fn starting_capacity(level: u32) -> usize {
    2 + usize::from(level < 1) + usize::from(level < 3)
}

struct Interior<K, V> {
    bitmap: u64,
    children: Vec<Child<K, V>>,
}

impl<K: HamtKey, V> Interior<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bitmap: 0,
            children: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    fn has_child(&self, bit_no: u32) -> bool {
        self.bitmap & (1u64 << bit_no) != 0
    }

    #[inline]
    fn child_index(&self, bit_no: u32) -> usize {
        (self.bitmap & ((1u64 << bit_no) - 1)).count_ones() as usize
    }

    /// Insert into the packed slot for `bit_no`, growing by one when full.
    fn add_child(&mut self, bit_no: u32, child: Child<K, V>) {
        if self.children.len() == self.children.capacity() {
            self.children.reserve_exact(1);
        }
        let i = self.child_index(bit_no);
        self.children.insert(i, child);
        self.bitmap |= 1u64 << bit_no;
    }

    fn remove_child(&mut self, bit_no: u32, index: usize) {
        self.children.remove(index);
        self.bitmap &= !(1u64 << bit_no);
    }

    /// Descend by successive low 6-bit slices of `hash`. The caller checks
    /// the returned leaf against the full hash and key.
    fn find(&self, hash: u32) -> Option<&Leaf<K, V>> {
        let bit_no = hash & (MAX_CHILDREN as u32 - 1);
        if !self.has_child(bit_no) {
            return None;
        }
        match &self.children[self.child_index(bit_no)] {
            Child::Leaf(leaf) => Some(leaf),
            Child::Node(node) => node.find(hash >> BIT_SHIFT),
        }
    }

    fn insert(&mut self, leaf: Leaf<K, V>, shift: u32) {
        assert!(shift + BIT_SHIFT < 32, "hash bits exhausted (32-bit collision)");
        let bit_no = bit_number(leaf.hash, shift);
        if !self.has_child(bit_no) {
            self.add_child(bit_no, Child::Leaf(leaf));
            return;
        }
        let i = self.child_index(bit_no);
        if let Child::Node(node) = &mut self.children[i] {
            node.insert(leaf, shift + BIT_SHIFT);
            return;
        }
        {
            let Child::Leaf(existing) = &mut self.children[i] else {
                unreachable!()
            };
            if existing.hash == leaf.hash && existing.key == leaf.key {
                existing.value = leaf.value;
                return;
            }
        }
        // Two different keys share this slice: push the existing leaf down
        // into a new interior node and insert the new one there.
        let placeholder = Child::Node(Interior::with_capacity(0));
        let Child::Leaf(existing) = std::mem::replace(&mut self.children[i], placeholder)
        else {
            unreachable!()
        };
        let mut node = Interior::with_capacity(starting_capacity(shift / BIT_SHIFT));
        node.add_child(
            bit_number(existing.hash, shift + BIT_SHIFT),
            Child::Leaf(existing),
        );
        node.insert(leaf, shift + BIT_SHIFT);
        self.children[i] = Child::Node(node);
    }

    fn remove(&mut self, hash: u32, key: &K, shift: u32) -> bool {
        assert!(shift + BIT_SHIFT < 32, "hash bits exhausted (32-bit collision)");
        let bit_no = bit_number(hash, shift);
        if !self.has_child(bit_no) {
            return false;
        }
        let i = self.child_index(bit_no);
        match &mut self.children[i] {
            Child::Leaf(leaf) => {
                if leaf.hash != hash || leaf.key != *key {
                    return false;
                }
            }
            Child::Node(node) => {
                if !node.remove(hash, key, shift + BIT_SHIFT) {
                    return false;
                }
                if node.bitmap != 0 {
                    return true;
                }
            }
        }
        // Matched leaf, or a nested node emptied out: unlink the child.
        // Capacity is retained.
        self.remove_child(bit_no, i);
        true
    }

    fn item_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                Child::Leaf(_) => 1,
                Child::Node(node) => node.item_count(),
            })
            .sum()
    }

    fn dump(&self, out: &mut dyn fmt::Write, indent: usize) -> fmt::Result {
        write!(out, "{:1$}{{", "", 2 * indent)?;
        let mut leaf_count = 0;
        for child in &self.children {
            match child {
                Child::Node(node) => {
                    writeln!(out)?;
                    node.dump(out, indent + 1)?;
                }
                Child::Leaf(_) => leaf_count += 1,
            }
        }
        if leaf_count > 0 {
            if leaf_count < self.children.len() {
                write!(out, "\n{:1$} ", "", 2 * indent)?;
            }
            for child in &self.children {
                if let Child::Leaf(leaf) = child {
                    write!(out, " {:08x}", leaf.hash)?;
                }
            }
        }
        write!(out, " }}")
    }
}

/// Hash Array Mapped Trie: an associative map from hashed keys to opaque
/// payloads, with in-place mutation.
///
/// # Example
///
/// ```
/// use fleece::Hamt;
///
/// let mut index: Hamt<String, u32> = Hamt::new();
/// index.insert("title".to_string(), 0x20);
/// assert_eq!(index.get(&"title".to_string()), Some(&0x20));
/// assert_eq!(index.count(), 1);
/// assert!(index.remove(&"title".to_string()));
/// assert_eq!(index.count(), 0);
/// ```
pub struct Hamt<K: HamtKey, V> {
    root: Option<Interior<K, V>>,
}

impl<K: HamtKey, V> Default for Hamt<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HamtKey, V> Hamt<K, V> {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Insert a key/value pair, overwriting the value on an exact key match.
    pub fn insert(&mut self, key: K, value: V) {
        let hash = key.hash_code();
        let root = self
            .root
            .get_or_insert_with(|| Interior::with_capacity(MAX_CHILDREN));
        root.insert(Leaf { hash, key, value }, 0);
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let root = self.root.as_ref()?;
        let hash = key.hash_code();
        let leaf = root.find(hash)?;
        if leaf.hash == hash && leaf.key == *key {
            Some(&leaf.value)
        } else {
            None
        }
    }

    /// Remove a key, returning whether it was present. Emptied interior
    /// nodes are collapsed on the way back up.
    pub fn remove(&mut self, key: &K) -> bool {
        match &mut self.root {
            Some(root) => root.remove(key.hash_code(), key, 0),
            None => false,
        }
    }

    /// Number of stored entries (counted recursively).
    #[must_use]
    pub fn count(&self) -> usize {
        self.root.as_ref().map_or(0, Interior::item_count)
    }

    /// Check whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.as_ref().map_or(true, |root| root.bitmap == 0)
    }

    /// Write a debug rendering of the tree structure.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "Hamt {{")?;
        if let Some(root) = &self.root {
            writeln!(out)?;
            root.dump(out, 1)?;
        }
        writeln!(out, "}}")
    }
}
