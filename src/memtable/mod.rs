//! In-memory ordered key/value map backed by a probabilistic skiplist.
//!
//! The memtable is the only mutable structure in the engine. It is not
//! write-ahead logged: a crash before flush loses whatever sits in the
//! memtable. Durability instead comes from sstable immutability once a
//! memtable is flushed (see [`crate::engine`]).
//!
//! The skiplist itself mirrors the classic design: each node carries a
//! tower of forward pointers whose height is chosen at insertion time by
//! repeated coin flips (`p = 0.5`), capped at [`MAX_LEVEL`].

use std::sync::RwLock;

use thiserror::Error;
use tracing::trace;

/// Tallest tower a skiplist node may have. 16 levels comfortably cover
/// millions of entries at `p = 0.5` without meaningfully hurting search
/// cost at low counts.
const MAX_LEVEL: usize = 16;

/// Errors produced by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The internal lock was poisoned by a panicking thread.
    #[error("memtable lock poisoned")]
    LockPoisoned,
}

type Result<T> = std::result::Result<T, MemtableError>;

struct Node {
    key: u64,
    value: Vec<u8>,
    forward: Vec<usize>,
}

/// A simple xorshift PRNG so the memtable has no external RNG dependency
/// for level assignment. Not cryptographic; only used to pick tower
/// heights.
struct Rng(u64);

impl Rng {
    fn new() -> Self {
        // Seed from the address of a stack value so distinct memtables
        // started close in time still diverge.
        let seed = {
            let x = 0u8;
            (&x as *const u8 as u64) ^ 0x9E3779B97F4A7C15
        };
        Rng(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Returns true with probability `p = 0.5`.
    fn coin_flip(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }
}

struct Inner {
    // head[l] gives the index of the first real node at level l; nodes
    // are stored in a flat arena and referenced by index so the
    // structure needs no pointers or lifetimes.
    head: Vec<usize>,
    nodes: Vec<Node>,
    max_level: usize,
    rng: Rng,
    byte_size: usize,
}

impl Inner {
    fn new() -> Self {
        Inner {
            head: vec![usize::MAX; MAX_LEVEL],
            nodes: Vec::new(),
            max_level: 1,
            rng: Rng::new(),
            byte_size: 0,
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.coin_flip() {
            level += 1;
        }
        level
    }

    fn forward_at(&self, idx: usize, level: usize) -> usize {
        if idx == usize::MAX {
            self.head[level]
        } else {
            self.nodes[idx].forward[level]
        }
    }

    fn set_forward(&mut self, idx: usize, level: usize, next: usize) {
        if idx == usize::MAX {
            self.head[level] = next;
        } else {
            self.nodes[idx].forward[level] = next;
        }
    }

    /// For each level, the index of the node immediately preceding
    /// where `key` would be inserted or found (`usize::MAX` = head).
    fn find_predecessors(&self, key: u64) -> [usize; MAX_LEVEL] {
        let mut update = [usize::MAX; MAX_LEVEL];
        let mut cur = usize::MAX;
        for level in (0..self.max_level).rev() {
            loop {
                let next = self.forward_at(cur, level);
                if next == usize::MAX || self.nodes[next].key >= key {
                    break;
                }
                cur = next;
            }
            update[level] = cur;
        }
        update
    }

    fn insert(&mut self, key: u64, value: Vec<u8>) {
        let update = self.find_predecessors(key);
        let candidate = self.forward_at(update[0], 0);
        if candidate != usize::MAX && self.nodes[candidate].key == key {
            self.byte_size = self.byte_size - self.nodes[candidate].value.len() + value.len();
            self.nodes[candidate].value = value;
            return;
        }

        let level = self.random_level();
        if level > self.max_level {
            self.max_level = level;
        }
        self.byte_size += entry_byte_cost(value.len());
        let idx = self.nodes.len();
        let mut forward = vec![usize::MAX; level];
        for (l, slot) in forward.iter_mut().enumerate() {
            let pred = update[l];
            *slot = self.forward_at(pred, l);
        }
        self.nodes.push(Node { key, value, forward });
        for level in 0..self.nodes[idx].forward.len() {
            let pred = update[level];
            self.set_forward(pred, level, idx);
        }
    }

    fn search(&self, key: u64) -> Option<&[u8]> {
        let update = self.find_predecessors(key);
        let candidate = self.forward_at(update[0], 0);
        if candidate != usize::MAX && self.nodes[candidate].key == key {
            Some(&self.nodes[candidate].value)
        } else {
            None
        }
    }

    fn lower_bound(&self, key: u64) -> Option<u64> {
        let update = self.find_predecessors(key);
        let candidate = self.forward_at(update[0], 0);
        if candidate == usize::MAX {
            None
        } else {
            Some(self.nodes[candidate].key)
        }
    }

    fn scan(&self, lo: u64, hi: u64) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let update = self.find_predecessors(lo);
        let mut cur = self.forward_at(update[0], 0);
        while cur != usize::MAX {
            let node = &self.nodes[cur];
            if node.key > hi {
                break;
            }
            out.push((node.key, node.value.clone()));
            cur = node.forward[0];
        }
        out
    }

    fn reset(&mut self) {
        self.head = vec![usize::MAX; MAX_LEVEL];
        self.nodes.clear();
        self.max_level = 1;
        self.byte_size = 0;
    }

    fn iter_all(&self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cur = self.head[0];
        while cur != usize::MAX {
            let node = &self.nodes[cur];
            out.push((node.key, node.value.clone()));
            cur = node.forward[0];
        }
        out
    }
}

/// The on-disk cost a single entry will add once flushed to an sstable:
/// 8 bytes for the key and 4 bytes for the offset in the key/offset
/// table, plus the raw value bytes.
fn entry_byte_cost(value_len: usize) -> usize {
    12 + value_len
}

/// Ordered, thread-synchronized in-memory key/value map.
///
/// `Memtable` is the write path's front door: every `put`/`del` lands
/// here first, and only a size-triggered flush turns its contents into
/// an immutable sstable.
pub struct Memtable {
    inner: RwLock<Inner>,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Memtable {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn insert(&self, key: u64, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| MemtableError::LockPoisoned)?;
        trace!(key, len = value.len(), "memtable insert");
        inner.insert(key, value);
        Ok(())
    }

    /// Returns the value for `key`, if present.
    pub fn search(&self, key: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(inner.search(key).map(<[u8]>::to_vec))
    }

    /// Physically removes `key`. Returns whether it was present.
    ///
    /// This is distinct from the engine-level tombstone delete: the
    /// memtable has no notion of "deleted but remembered as deleted" —
    /// that semantics is layered on top by writing a tombstone value.
    pub fn del(&self, key: u64) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|_| MemtableError::LockPoisoned)?;
        let update = inner.find_predecessors(key);
        let candidate = inner.forward_at(update[0], 0);
        if candidate == usize::MAX || inner.nodes[candidate].key != key {
            return Ok(false);
        }
        let removed_len = inner.nodes[candidate].value.len();
        let forward = inner.nodes[candidate].forward.clone();
        for (level, next) in forward.into_iter().enumerate() {
            let pred = update[level];
            if inner.forward_at(pred, level) == candidate {
                inner.set_forward(pred, level, next);
            }
        }
        inner.byte_size -= entry_byte_cost(removed_len);
        Ok(true)
    }

    /// Returns all (key, value) pairs with `lo <= key <= hi`, ascending.
    pub fn scan(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(inner.scan(lo, hi))
    }

    /// Returns the smallest stored key `>= key`, if any.
    pub fn lower_bound(&self, key: u64) -> Result<Option<u64>> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(inner.lower_bound(key))
    }

    /// Clears every entry.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| MemtableError::LockPoisoned)?;
        inner.reset();
        Ok(())
    }

    /// Projected byte size of the sstable this memtable would serialize
    /// into: `32` (header) + `10240` (bloom) + `12` bytes per entry +
    /// the raw value bytes.
    pub fn byte_size(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(32 + 10240 + inner.byte_size)
    }

    /// What [`Memtable::byte_size`] would report after inserting
    /// `(key, value)`, without mutating the memtable. Used by the engine
    /// to decide whether to flush before inserting.
    pub fn projected_byte_size_with(&self, key: u64, value: &[u8]) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        let existing = inner.search(key).map(<[u8]>::len);
        let current = (32 + 10240 + inner.byte_size) as isize;
        let delta = match existing {
            Some(old_len) => value.len() as isize - old_len as isize,
            None => entry_byte_cost(value.len()) as isize,
        };
        Ok((current + delta).max(0) as usize)
    }

    /// Returns every entry in ascending key order, for flushing.
    pub fn iter_for_flush(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(inner.iter_all())
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| MemtableError::LockPoisoned)?;
        Ok(inner.nodes.len())
    }

    /// Whether the memtable holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_search() {
        let mt = Memtable::new();
        mt.insert(1, b"a".to_vec()).unwrap();
        mt.insert(2, b"b".to_vec()).unwrap();
        assert_eq!(mt.search(1).unwrap(), Some(b"a".to_vec()));
        assert_eq!(mt.search(2).unwrap(), Some(b"b".to_vec()));
        assert_eq!(mt.search(3).unwrap(), None);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let mt = Memtable::new();
        mt.insert(1, b"a".to_vec()).unwrap();
        mt.insert(1, b"aa".to_vec()).unwrap();
        assert_eq!(mt.search(1).unwrap(), Some(b"aa".to_vec()));
        assert_eq!(mt.len().unwrap(), 1);
    }

    #[test]
    fn del_removes_key() {
        let mt = Memtable::new();
        mt.insert(1, b"a".to_vec()).unwrap();
        assert!(mt.del(1).unwrap());
        assert_eq!(mt.search(1).unwrap(), None);
        assert!(!mt.del(1).unwrap());
    }

    #[test]
    fn scan_is_ascending_and_bounded() {
        let mt = Memtable::new();
        for k in 0..20u64 {
            mt.insert(k, vec![k as u8]).unwrap();
        }
        let got = mt.scan(5, 10).unwrap();
        let keys: Vec<u64> = got.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (5..=10).collect::<Vec<_>>());
    }

    #[test]
    fn reset_clears_everything() {
        let mt = Memtable::new();
        for k in 0..100u64 {
            mt.insert(k, vec![0u8; 4]).unwrap();
        }
        mt.reset().unwrap();
        assert_eq!(mt.len().unwrap(), 0);
        assert_eq!(mt.scan(0, 100).unwrap().len(), 0);
        assert_eq!(mt.byte_size().unwrap(), 32 + 10240);
    }

    #[test]
    fn lower_bound_finds_smallest_key_at_or_above() {
        let mt = Memtable::new();
        for k in [1u64, 5, 9, 20] {
            mt.insert(k, vec![]).unwrap();
        }
        assert_eq!(mt.lower_bound(6).unwrap(), Some(9));
        assert_eq!(mt.lower_bound(21).unwrap(), None);
    }

    #[test]
    fn many_keys_preserve_order_under_random_levels() {
        let mt = Memtable::new();
        let mut keys: Vec<u64> = (0..2000).collect();
        // insert out of order to exercise predecessor search at every level
        keys.reverse();
        for k in &keys {
            mt.insert(*k, vec![]).unwrap();
        }
        let scanned = mt.scan(0, 1999).unwrap();
        let scanned_keys: Vec<u64> = scanned.iter().map(|(k, _)| *k).collect();
        assert_eq!(scanned_keys, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn projected_byte_size_matches_after_actual_insert() {
        let mt = Memtable::new();
        mt.insert(1, vec![0u8; 5]).unwrap();
        let projected = mt.projected_byte_size_with(2, &[0u8; 7]).unwrap();
        mt.insert(2, vec![0u8; 7]).unwrap();
        assert_eq!(projected, mt.byte_size().unwrap());
    }

    #[test]
    fn byte_size_accounts_for_overwrite() {
        let mt = Memtable::new();
        mt.insert(1, vec![0u8; 10]).unwrap();
        let first = mt.byte_size().unwrap();
        mt.insert(1, vec![0u8; 20]).unwrap();
        let second = mt.byte_size().unwrap();
        assert_eq!(second - first, 10);
    }
}
