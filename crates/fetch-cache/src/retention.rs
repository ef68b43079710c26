//! Size- and count-bounded LRU over stored entries
//!
//! Independent of freshness: an entry can be fresh and still be evicted, or
//! stale and still retained until its next refresh replaces it.

use crate::types::{CacheKey, StoreUsage};
use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks recency and size of every stored entry and picks eviction victims
#[derive(Debug)]
pub struct Retention {
    max_bytes: u64,
    max_entries: usize,
    lru: Mutex<Lru>,
}

impl Retention {
    pub fn new(max_bytes: u64, max_entries: usize) -> Self {
        Self {
            max_bytes,
            max_entries,
            lru: Mutex::new(Lru::default()),
        }
    }

    /// Record a freshly stored entry as most recently used and return the
    /// entries (with their sizes) that must be evicted to get back under budget.
    ///
    /// An entry larger than the whole byte budget is returned as its own victim.
    pub fn admit(&self, key: CacheKey, size: u64) -> Vec<(CacheKey, u64)> {
        let mut lru = self.lock();
        lru.insert(key, size);

        let mut victims = Vec::new();
        while lru.total_bytes > self.max_bytes || lru.index.len() > self.max_entries {
            match lru.pop_least_recent() {
                Some(victim) => victims.push(victim),
                None => break,
            }
        }
        victims
    }

    /// Mark an entry as just used; returns false if it is not tracked
    pub fn touch(&self, key: &CacheKey) -> bool {
        self.lock().touch(key)
    }

    /// Stop tracking an entry, returning its size if it was tracked
    pub fn forget(&self, key: &CacheKey) -> Option<u64> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().index.contains_key(key)
    }

    pub fn usage(&self) -> StoreUsage {
        let lru = self.lock();
        StoreUsage {
            entries: lru.index.len(),
            total_size: lru.total_bytes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lru> {
        // Lru mutations never panic midway, so a poisoned lock still holds a valid list
        self.lru.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
struct Slot {
    key: CacheKey,
    size: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena of slots threaded into a doubly linked recency list.
/// `head` is the most recently used slot, `tail` the next eviction victim.
#[derive(Debug, Default)]
struct Lru {
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_bytes: u64,
}

impl Lru {
    fn insert(&mut self, key: CacheKey, size: u64) {
        if let Some(&idx) = self.index.get(&key) {
            self.total_bytes = self.total_bytes - self.slots[idx].size + size;
            self.slots[idx].size = size;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        let slot = Slot {
            key: key.clone(),
            size,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };

        self.index.insert(key, idx);
        self.total_bytes += size;
        self.push_front(idx);
    }

    fn touch(&mut self, key: &CacheKey) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.unlink(idx);
                self.push_front(idx);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<u64> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let size = std::mem::take(&mut self.slots[idx].size);
        self.total_bytes -= size;
        self.free.push(idx);
        Some(size)
    }

    fn pop_least_recent(&mut self) -> Option<(CacheKey, u64)> {
        let idx = self.tail?;
        let key = self.slots[idx].key.clone();
        let size = self.remove(&key)?;
        Some((key, size))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.slots[idx].prev = None;
        self.slots[idx].next = old_head;
        match old_head {
            Some(h) => self.slots[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }
}
