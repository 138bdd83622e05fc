//! Cache Store: path -> opaque blob.
//!
//! Only the dispatcher mutates a store, and only by merging a well-formed
//! scan result. Later merges overwrite earlier ones for the same path.
//! Entries are never dropped when the source file disappears.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

pub trait CacheStore: Send {
    fn get(&self, path: &str) -> Option<&[u8]>;

    /// Insert every entry, overwriting existing paths. Returns how many were written.
    fn merge(&mut self, entries: BTreeMap<String, Vec<u8>>) -> usize;

    fn remove(&mut self, path: &str) -> Option<Vec<u8>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    fn merge(&mut self, entries: BTreeMap<String, Vec<u8>>) -> usize {
        let count = entries.len();
        self.entries.extend(entries);
        count
    }

    fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.entries.remove(path)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Caps any store at `max_entries`, evicting the least recently merged path.
///
/// Lookups do not refresh an entry; only a merge does.
#[derive(Debug)]
pub struct BoundedStore<S> {
    inner: S,
    max_entries: usize,
    // path -> merge sequence, and the reverse index ordered oldest first
    merged_at: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    evicted: u64,
}

impl<S: CacheStore> BoundedStore<S> {
    pub fn new(inner: S, max_entries: NonZeroUsize) -> Self {
        Self {
            inner,
            max_entries: max_entries.get(),
            merged_at: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            evicted: 0,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Total entries evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn touch(&mut self, path: &str) {
        if let Some(seq) = self.merged_at.remove(path) {
            self.order.remove(&seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.merged_at.insert(path.to_string(), seq);
        self.order.insert(seq, path.to_string());
    }

    fn evict_overflow(&mut self) {
        while self.inner.len() > self.max_entries {
            let Some((_, path)) = self.order.pop_first() else {
                break;
            };
            self.merged_at.remove(&path);
            self.inner.remove(&path);
            self.evicted += 1;
        }
    }
}

impl<S: CacheStore> CacheStore for BoundedStore<S> {
    fn get(&self, path: &str) -> Option<&[u8]> {
        self.inner.get(path)
    }

    fn merge(&mut self, entries: BTreeMap<String, Vec<u8>>) -> usize {
        for path in entries.keys() {
            self.touch(path);
        }
        let count = self.inner.merge(entries);
        self.evict_overflow();
        count
    }

    fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        if let Some(seq) = self.merged_at.remove(path) {
            self.order.remove(&seq);
        }
        self.inner.remove(path)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
