//! Bounded LRU cache backing the frame cache.
//!
//! A hash index over an intrusive doubly-linked list of slots. Lookups move
//! the entry to the most-recently-used end; inserting at capacity evicts the
//! least-recently-used entry. Every key present in the index refers to a
//! live slot on the list and vice versa.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a key, promoting the entry to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|s| &s.value)
    }

    /// Insert a value, returning the evicted entry if the cache was full.
    ///
    /// Re-inserting an existing key replaces the value in place and returns
    /// the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            let slot = self.slots[idx].as_mut().expect("indexed slot is live");
            let old = std::mem::replace(&mut slot.value, value);
            self.unlink(idx);
            self.push_front(idx);
            return Some((key, old));
        }

        let evicted = if self.index.len() >= self.capacity { self.evict_lru() } else { None };

        let slot = Slot { key: key.clone(), value, prev: NIL, next: NIL };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };

        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        self.free.push(idx);
        let slot = self.slots[idx].take().expect("tail slot is live");
        self.index.remove(&slot.key);
        Some((slot.key, slot.value))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("linked slot is live");
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].as_mut().expect("prev slot is live").next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].as_mut().expect("next slot is live").prev = prev;
        }
        let slot = self.slots[idx].as_mut().expect("linked slot is live");
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("slot is live");
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().expect("head slot is live").prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Verify the index and the recency list agree. Test support.
    #[cfg(test)]
    fn check_coherent(&self) {
        let mut seen = 0;
        let mut idx = self.head;
        let mut prev = NIL;
        while idx != NIL {
            let slot = self.slots[idx].as_ref().expect("listed slot is live");
            assert_eq!(slot.prev, prev);
            assert_eq!(self.index.get(&slot.key), Some(&idx));
            prev = idx;
            idx = slot.next;
            seen += 1;
            assert!(seen <= self.index.len(), "recency list longer than index");
        }
        assert_eq!(seen, self.index.len(), "recency list shorter than index");
        assert_eq!(self.tail, prev);
    }
}
