//! Cache Store Module
//!
//! Ordered map from hostname to [`CacheEntry`] built inside a shared
//! segment. It is an AVL tree whose nodes are arena blocks linked by
//! [`Offset`]; each node block carries its key bytes right after the node
//! header.

use std::cmp::Ordering;
use std::mem::size_of;
use std::ptr;

use crate::cache::{CacheEntry, SharedCounters};
use crate::error::{CacheError, Result};
use crate::shm::{arena, Arena, Offset};

/// Anonymous map object registered as the arena's root object.
#[repr(C)]
struct MapHeader {
    root: Offset,
    len: u64,
    counters: SharedCounters,
}

#[repr(C)]
struct Node {
    left: Offset,
    right: Offset,
    height: u32,
    key_len: u32,
    entry: CacheEntry,
}

const NODE_SIZE: usize = size_of::<Node>();

// == Cache Store ==
/// A view of the map stored in an arena.
///
/// The store holds no locks of its own: read methods need the shared lock,
/// `&mut self` methods need the exclusive lock.
#[derive(Debug)]
pub struct CacheStore {
    arena: Arena,
    header: Offset,
}

impl CacheStore {
    /// Smallest segment an empty map can be constructed in.
    pub const fn min_segment_size() -> usize {
        arena::region_size_for(size_of::<MapHeader>())
    }

    // == Construct ==
    /// Allocates an empty map in the arena and registers it as the root
    /// object so other processes can find it.
    pub fn construct(arena: Arena) -> Result<Self> {
        let header = arena
            .allocate(size_of::<MapHeader>())
            .ok_or_else(|| CacheError::OutOfMemory {
                requested: size_of::<MapHeader>(),
                available: arena.free_bytes(),
            })?;
        unsafe {
            arena.ptr::<MapHeader>(header).write(MapHeader {
                root: Offset::NULL,
                len: 0,
                counters: SharedCounters::default(),
            });
        }
        arena.set_root_object(header);
        Ok(Self { arena, header })
    }

    /// Opens the map previously constructed in the arena.
    pub fn open(arena: Arena) -> Result<Self> {
        let header = arena.root_object();
        if header.is_null() {
            return Err(CacheError::InvalidSegment(
                "segment holds no cache map".to_string(),
            ));
        }
        Ok(Self { arena, header })
    }

    /// Frees every node and the map object itself.
    pub fn destroy(mut self) {
        self.clear();
        self.arena.set_root_object(Offset::NULL);
        self.arena.free(self.header);
    }

    // == Length ==
    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        unsafe { (*self.map()).len as usize }
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &SharedCounters {
        unsafe { &(*self.map()).counters }
    }

    // == Get ==
    /// Returns a copy of the entry stored for `key`, expired or not.
    pub fn get(&self, key: &[u8]) -> Option<CacheEntry> {
        let mut at = self.root();
        while !at.is_null() {
            match key.cmp(self.key(at)) {
                Ordering::Less => at = self.left(at),
                Ordering::Greater => at = self.right(at),
                Ordering::Equal => return Some(unsafe { (*self.node(at)).entry }),
            }
        }
        None
    }

    // == Insert Or Assign ==
    /// Stores `entry` under `key`.
    ///
    /// Returns `true` when a node was created and `false` when an existing
    /// entry was overwritten in place. Only creation allocates, so updates
    /// succeed even when the arena is full.
    pub fn insert_or_assign(&mut self, key: &[u8], entry: &CacheEntry) -> Result<bool> {
        let (root, inserted) = self.insert_at(self.root(), key, entry)?;
        self.set_root(root);
        if inserted {
            unsafe { (*self.map()).len += 1 };
        }
        Ok(inserted)
    }

    // == Remove ==
    /// Removes `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let (root, removed) = self.remove_at(self.root(), key);
        self.set_root(root);
        if removed {
            unsafe { (*self.map()).len -= 1 };
        }
        removed
    }

    // == Remove Expired ==
    /// Removes every entry whose expiration is at or before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_expired(&mut self, now: i64) -> usize {
        let mut expired = Vec::new();
        self.walk_in_order(|store, at| {
            if unsafe { (*store.node(at)).entry.is_expired_at(now) } {
                expired.push(store.key(at).to_vec());
            }
        });

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    // == Clear ==
    /// Removes all entries, returning their blocks to the arena.
    pub fn clear(&mut self) {
        let mut pending = vec![self.root()];
        while let Some(at) = pending.pop() {
            if at.is_null() {
                continue;
            }
            pending.push(self.left(at));
            pending.push(self.right(at));
            self.arena.free(at);
        }
        self.set_root(Offset::NULL);
        unsafe { (*self.map()).len = 0 };
    }

    // == Entries ==
    /// Copies out all entries in key order.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let mut entries = Vec::with_capacity(self.len());
        self.walk_in_order(|store, at| {
            let key = String::from_utf8_lossy(store.key(at)).into_owned();
            entries.push((key, unsafe { (*store.node(at)).entry }));
        });
        entries
    }

    // == Tree Internals ==
    fn insert_at(&mut self, at: Offset, key: &[u8], entry: &CacheEntry) -> Result<(Offset, bool)> {
        if at.is_null() {
            return Ok((self.allocate_node(key, entry)?, true));
        }

        match key.cmp(self.key(at)) {
            Ordering::Less => {
                let (child, inserted) = self.insert_at(self.left(at), key, entry)?;
                self.set_left(at, child);
                Ok((if inserted { self.rebalance(at) } else { at }, inserted))
            }
            Ordering::Greater => {
                let (child, inserted) = self.insert_at(self.right(at), key, entry)?;
                self.set_right(at, child);
                Ok((if inserted { self.rebalance(at) } else { at }, inserted))
            }
            Ordering::Equal => {
                unsafe { (*self.node(at)).entry = *entry };
                Ok((at, false))
            }
        }
    }

    fn remove_at(&mut self, at: Offset, key: &[u8]) -> (Offset, bool) {
        if at.is_null() {
            return (Offset::NULL, false);
        }

        match key.cmp(self.key(at)) {
            Ordering::Less => {
                let (child, removed) = self.remove_at(self.left(at), key);
                self.set_left(at, child);
                (if removed { self.rebalance(at) } else { at }, removed)
            }
            Ordering::Greater => {
                let (child, removed) = self.remove_at(self.right(at), key);
                self.set_right(at, child);
                (if removed { self.rebalance(at) } else { at }, removed)
            }
            Ordering::Equal => {
                let replacement = self.unlink(at);
                self.arena.free(at);
                (replacement, true)
            }
        }
    }

    /// Detaches `at` from its children and returns the subtree that takes
    /// its place.
    fn unlink(&mut self, at: Offset) -> Offset {
        let left = self.left(at);
        let right = self.right(at);
        if left.is_null() {
            return right;
        }
        if right.is_null() {
            return left;
        }

        let (rest, successor) = self.take_min(right);
        self.set_left(successor, left);
        self.set_right(successor, rest);
        self.rebalance(successor)
    }

    /// Removes the leftmost node of the subtree rooted at `at`.
    ///
    /// Returns the new subtree root and the detached node.
    fn take_min(&mut self, at: Offset) -> (Offset, Offset) {
        let left = self.left(at);
        if left.is_null() {
            return (self.right(at), at);
        }

        let (rest, min) = self.take_min(left);
        self.set_left(at, rest);
        (self.rebalance(at), min)
    }

    fn rebalance(&mut self, at: Offset) -> Offset {
        self.update_height(at);
        let balance = self.balance(at);

        if balance > 1 {
            let left = self.left(at);
            if self.balance(left) < 0 {
                let rotated = self.rotate_left(left);
                self.set_left(at, rotated);
            }
            return self.rotate_right(at);
        }
        if balance < -1 {
            let right = self.right(at);
            if self.balance(right) > 0 {
                let rotated = self.rotate_right(right);
                self.set_right(at, rotated);
            }
            return self.rotate_left(at);
        }
        at
    }

    fn rotate_right(&mut self, at: Offset) -> Offset {
        let pivot = self.left(at);
        self.set_left(at, self.right(pivot));
        self.set_right(pivot, at);
        self.update_height(at);
        self.update_height(pivot);
        pivot
    }

    fn rotate_left(&mut self, at: Offset) -> Offset {
        let pivot = self.right(at);
        self.set_right(at, self.left(pivot));
        self.set_left(pivot, at);
        self.update_height(at);
        self.update_height(pivot);
        pivot
    }

    fn update_height(&mut self, at: Offset) {
        let height = 1 + self.height(self.left(at)).max(self.height(self.right(at)));
        unsafe { (*self.node(at)).height = height };
    }

    fn balance(&self, at: Offset) -> i64 {
        i64::from(self.height(self.left(at))) - i64::from(self.height(self.right(at)))
    }

    fn allocate_node(&mut self, key: &[u8], entry: &CacheEntry) -> Result<Offset> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| CacheError::InvalidKey(format!("key of {} bytes", key.len())))?;
        let requested = NODE_SIZE + key.len();
        let at = self
            .arena
            .allocate(requested)
            .ok_or_else(|| CacheError::OutOfMemory {
                requested,
                available: self.arena.free_bytes(),
            })?;

        unsafe {
            self.node(at).write(Node {
                left: Offset::NULL,
                right: Offset::NULL,
                height: 1,
                key_len,
                entry: *entry,
            });
            ptr::copy_nonoverlapping(key.as_ptr(), self.arena.bytes(at).add(NODE_SIZE), key.len());
        }
        Ok(at)
    }

    fn walk_in_order(&self, mut visit: impl FnMut(&Self, Offset)) {
        let mut stack = Vec::new();
        let mut at = self.root();
        loop {
            while !at.is_null() {
                stack.push(at);
                at = self.left(at);
            }
            let Some(next) = stack.pop() else { break };
            visit(self, next);
            at = self.right(next);
        }
    }

    // == Node Access ==
    fn map(&self) -> *mut MapHeader {
        self.arena.ptr(self.header)
    }

    fn root(&self) -> Offset {
        unsafe { (*self.map()).root }
    }

    fn set_root(&mut self, root: Offset) {
        unsafe { (*self.map()).root = root };
    }

    fn node(&self, at: Offset) -> *mut Node {
        self.arena.ptr(at)
    }

    fn key(&self, at: Offset) -> &[u8] {
        unsafe {
            let len = (*self.node(at)).key_len as usize;
            std::slice::from_raw_parts(self.arena.bytes(at).add(NODE_SIZE), len)
        }
    }

    fn left(&self, at: Offset) -> Offset {
        unsafe { (*self.node(at)).left }
    }

    fn right(&self, at: Offset) -> Offset {
        unsafe { (*self.node(at)).right }
    }

    fn height(&self, at: Offset) -> u32 {
        if at.is_null() {
            0
        } else {
            unsafe { (*self.node(at)).height }
        }
    }

    fn set_left(&mut self, at: Offset, child: Offset) {
        unsafe { (*self.node(at)).left = child };
    }

    fn set_right(&mut self, at: Offset, child: Offset) {
        unsafe { (*self.node(at)).right = child };
    }

    /// Verifies ordering and AVL balance, returning the tree height.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> u32 {
        fn check(store: &CacheStore, at: Offset) -> u32 {
            if at.is_null() {
                return 0;
            }
            let left = store.left(at);
            let right = store.right(at);
            if !left.is_null() {
                assert!(store.key(left) < store.key(at), "left child out of order");
            }
            if !right.is_null() {
                assert!(store.key(right) > store.key(at), "right child out of order");
            }
            let lh = check(store, left);
            let rh = check(store, right);
            assert!(lh.abs_diff(rh) <= 1, "unbalanced node");
            assert_eq!(store.height(at), 1 + lh.max(rh), "stale height");
            1 + lh.max(rh)
        }
        check(self, self.root())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Alias;
    use crate::shm::arena::HeapRegion;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;

    fn entry(alias: &str, ttl: u64) -> CacheEntry {
        CacheEntry::new(Alias::new(alias).unwrap(), NOW, Duration::from_secs(ttl))
    }

    fn new_store(len: usize) -> (HeapRegion, CacheStore) {
        let (region, arena) = HeapRegion::formatted(len);
        (region, CacheStore::construct(arena).unwrap())
    }

    #[test]
    fn test_construct_fits_min_segment_size() {
        let (_region, store) = new_store(CacheStore::min_segment_size());
        assert!(store.is_empty());

        let (_region, arena) = HeapRegion::formatted(CacheStore::min_segment_size() - 16);
        assert!(matches!(
            CacheStore::construct(arena),
            Err(CacheError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_store_new() {
        let (_region, store) = new_store(64 * 1024);

        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert!(store.get(b"missing").is_none());
    }

    #[test]
    fn test_store_open_finds_constructed_map() {
        let (mut region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();

        let reopened = CacheStore::open(region.arena()).unwrap();

        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(b"host1").unwrap().hostname.as_str(), "1.2.3.4");
    }

    #[test]
    fn test_store_open_without_map_fails() {
        let (_region, arena) = HeapRegion::formatted(4096);
        assert!(matches!(
            CacheStore::open(arena),
            Err(CacheError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_store_insert_and_get() {
        let (_region, mut store) = new_store(64 * 1024);

        let inserted = store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();

        assert!(inserted);
        assert_eq!(store.get(b"host1"), Some(entry("1.2.3.4", 60)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_overwrite() {
        let (mut region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();
        let free_after_insert = region.arena().free_bytes();

        let inserted = store.insert_or_assign(b"host1", &entry("5.6.7.8", 120)).unwrap();

        assert!(!inserted);
        let stored = store.get(b"host1").unwrap();
        assert_eq!(stored.hostname.as_str(), "5.6.7.8");
        assert_eq!(stored.expiration, NOW + 120);
        assert_eq!(store.len(), 1);
        assert_eq!(region.arena().free_bytes(), free_after_insert);
    }

    #[test]
    fn test_store_keys_are_case_sensitive() {
        let (_region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"Host", &entry("a", 60)).unwrap();
        store.insert_or_assign(b"host", &entry("b", 60)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b"Host").unwrap().hostname.as_str(), "a");
        assert_eq!(store.get(b"host").unwrap().hostname.as_str(), "b");
    }

    #[test]
    fn test_store_remove() {
        let (_region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();

        assert!(store.remove(b"host1"));
        assert!(store.is_empty());
        assert!(store.get(b"host1").is_none());
    }

    #[test]
    fn test_store_remove_nonexistent() {
        let (_region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();

        assert!(!store.remove(b"host2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_entries_sorted() {
        let (_region, mut store) = new_store(64 * 1024);
        for key in ["delta", "alpha", "charlie", "bravo"] {
            store.insert_or_assign(key.as_bytes(), &entry(key, 60)).unwrap();
        }

        let keys: Vec<String> = store.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn test_store_stays_balanced() {
        let (_region, mut store) = new_store(1024 * 1024);

        // Sequential keys are the worst case for an unbalanced tree.
        for i in 0..512 {
            let key = format!("host{i:04}");
            store.insert_or_assign(key.as_bytes(), &entry("x", 60)).unwrap();
        }
        let height = store.check_invariants();
        assert!(height <= 13, "height {height} too large for 512 nodes");

        for i in (0..512).step_by(3) {
            let key = format!("host{i:04}");
            assert!(store.remove(key.as_bytes()));
        }
        store.check_invariants();
        assert_eq!(store.len(), 512 - 171);
    }

    #[test]
    fn test_store_remove_expired() {
        let (_region, mut store) = new_store(64 * 1024);
        store.insert_or_assign(b"a", &entry("1", 10)).unwrap();
        store.insert_or_assign(b"b", &entry("2", 100)).unwrap();
        store.insert_or_assign(b"c", &entry("3", 20)).unwrap();
        store.insert_or_assign(b"d", &entry("4", 0)).unwrap();

        let removed = store.remove_expired(NOW + 20);

        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);
        assert!(store.get(b"b").is_some());
        store.check_invariants();
    }

    #[test]
    fn test_store_clear_restores_memory() {
        let (mut region, mut store) = new_store(64 * 1024);
        let initial = region.arena().free_bytes();

        for i in 0..50 {
            let key = format!("host{i}");
            store.insert_or_assign(key.as_bytes(), &entry("x", 60)).unwrap();
        }
        assert!(region.arena().free_bytes() < initial);

        store.clear();

        assert!(store.is_empty());
        assert_eq!(region.arena().free_bytes(), initial);
    }

    #[test]
    fn test_store_out_of_memory_leaves_store_usable() {
        let (_region, mut store) = new_store(4096);

        let mut inserted = 0;
        let err = loop {
            let key = format!("host{inserted}");
            match store.insert_or_assign(key.as_bytes(), &entry("x", 60)) {
                Ok(_) => inserted += 1,
                Err(err) => break err,
            }
        };

        assert!(matches!(err, CacheError::OutOfMemory { .. }));
        assert!(inserted > 0);
        assert_eq!(store.len(), inserted);
        assert!(store.get(b"host0").is_some());
        // Updates need no allocation.
        assert!(!store.insert_or_assign(b"host0", &entry("y", 60)).unwrap());
        store.check_invariants();
    }

    #[test]
    fn test_store_destroy_frees_everything() {
        let (mut region, arena) = HeapRegion::formatted(64 * 1024);
        let initial = arena.free_bytes();
        let mut store = CacheStore::construct(arena).unwrap();
        store.insert_or_assign(b"host1", &entry("1.2.3.4", 60)).unwrap();

        store.destroy();

        let arena = region.arena();
        assert_eq!(arena.free_bytes(), initial);
        assert!(arena.root_object().is_null());
    }
}
