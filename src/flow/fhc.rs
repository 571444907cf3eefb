//! Flow-hash cache
//!
//! Bounded LRU from primary digest to metadata digest, letting repeated
//! flows skip DPI. Single lock; all operations O(1) amortized. On insert
//! at capacity, `capacity / purge_divisor` entries are dropped from the
//! LRU tail in one pass.
//!
//! Persisted as a flat binary file of 40-byte records (primary digest
//! followed by metadata digest), no header, no framing.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{FlowDigest, DIGEST_LEN};

const NIL: usize = usize::MAX;

struct Node {
    key: FlowDigest,
    value: FlowDigest,
    prev: usize,
    next: usize,
}

/// Intrusive doubly-linked LRU over a slab of nodes
struct FhcInner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    lookup: HashMap<FlowDigest, usize>,
}

impl FhcInner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn remove_tail(&mut self) -> Option<FlowDigest> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        let key = self.nodes[idx].key;
        self.lookup.remove(&key);
        self.free.push(idx);
        Some(key)
    }
}

/// Bounded LRU digest cache
pub struct FlowHashCache {
    capacity: usize,
    purge_divisor: usize,
    inner: Mutex<FhcInner>,
}

impl FlowHashCache {
    pub fn new(capacity: usize, purge_divisor: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            purge_divisor: purge_divisor.max(1),
            inner: Mutex::new(FhcInner {
                nodes: Vec::with_capacity(capacity),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                lookup: HashMap::with_capacity(capacity),
            }),
        }
    }

    /// Insert at the head. A duplicate key is left untouched: the racing
    /// insert that got there first wins, which is benign.
    pub fn push(&self, key: FlowDigest, value: FlowDigest) {
        let mut inner = self.inner.lock();

        if inner.lookup.contains_key(&key) {
            warn!("Found existing digest in flow hash cache on push");
            return;
        }

        if inner.lookup.len() >= self.capacity {
            let purge = (self.capacity / self.purge_divisor).max(1);
            debug!("Purging {} flow hash cache entries", purge);
            for _ in 0..purge {
                if inner.remove_tail().is_none() {
                    break;
                }
            }
        }

        let node = Node { key, value, prev: NIL, next: NIL };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.nodes[idx] = node;
                idx
            }
            None => {
                inner.nodes.push(node);
                inner.nodes.len() - 1
            }
        };
        inner.push_front(idx);
        inner.lookup.insert(key, idx);
    }

    /// Fetch and refresh: a hit moves the entry to the head.
    pub fn pop(&self, key: &FlowDigest) -> Option<FlowDigest> {
        let mut inner = self.inner.lock();

        let idx = *inner.lookup.get(key)?;
        inner.unlink(idx);
        inner.push_front(idx);
        Some(inner.nodes[idx].value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.free.clear();
        inner.lookup.clear();
        inner.head = NIL;
        inner.tail = NIL;
    }

    /// Load records saved by `save`. Best-effort: a short trailing record
    /// is ignored.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = File::open(&path)
            .with_context(|| format!("Failed to open flow hash cache: {}", path.as_ref().display()))?;
        let mut reader = BufReader::new(file);

        let mut record = [0u8; DIGEST_LEN * 2];
        let mut loaded = 0;
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {
                    let mut key = [0u8; DIGEST_LEN];
                    let mut value = [0u8; DIGEST_LEN];
                    key.copy_from_slice(&record[..DIGEST_LEN]);
                    value.copy_from_slice(&record[DIGEST_LEN..]);
                    self.push(key, value);
                    loaded += 1;
                }
                Err(_) => break,
            }
        }

        debug!("Loaded {} flow hash cache entries", loaded);
        Ok(loaded)
    }

    /// Write all records, most recently used first.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = File::create(&path)
            .with_context(|| format!("Failed to save flow hash cache: {}", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);

        let inner = self.inner.lock();
        let mut idx = inner.head;
        let mut saved = 0;
        while idx != NIL {
            writer.write_all(&inner.nodes[idx].key)?;
            writer.write_all(&inner.nodes[idx].value)?;
            saved += 1;
            idx = inner.nodes[idx].next;
        }
        writer.flush()?;

        debug!("Saved {} flow hash cache entries", saved);
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u32) -> FlowDigest {
        let mut d = [0u8; DIGEST_LEN];
        d[..4].copy_from_slice(&n.to_be_bytes());
        d
    }

    #[test]
    fn test_push_pop() {
        let cache = FlowHashCache::new(100, 10);
        cache.push(digest(1), digest(1001));

        assert_eq!(cache.pop(&digest(1)), Some(digest(1001)));
        assert_eq!(cache.pop(&digest(2)), None);
    }

    #[test]
    fn test_duplicate_push_is_noop() {
        let cache = FlowHashCache::new(100, 10);
        cache.push(digest(1), digest(1001));
        cache.push(digest(1), digest(2002));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pop(&digest(1)), Some(digest(1001)));
    }

    #[test]
    fn test_lru_purge_at_capacity() {
        let cap = 100;
        let cache = FlowHashCache::new(cap, 10);
        for n in 0..=cap as u32 {
            cache.push(digest(n), digest(n + 10_000));
        }

        // cap/divisor oldest entries were dropped on the overflowing push.
        assert_eq!(cache.len(), cap - cap / 10 + 1);
        let dropped = (0..(cap / 10) as u32)
            .filter(|n| cache.pop(&digest(*n)).is_none())
            .count();
        assert_eq!(dropped, cap / 10);
        assert!(cache.pop(&digest(cap as u32)).is_some());
    }

    #[test]
    fn test_pop_refreshes_recency() {
        let cache = FlowHashCache::new(10, 10);
        for n in 0..10u32 {
            cache.push(digest(n), digest(n + 100));
        }

        // Refresh the oldest entry, then overflow: the refreshed entry
        // must survive the tail purge.
        assert!(cache.pop(&digest(0)).is_some());
        cache.push(digest(10), digest(110));
        assert!(cache.pop(&digest(0)).is_some());
        assert!(cache.pop(&digest(1)).is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fhc.dat");

        let cache = FlowHashCache::new(100, 10);
        for n in 0..50u32 {
            cache.push(digest(n), digest(n + 100));
        }
        let saved = cache.save(&path).unwrap();
        assert_eq!(saved, 50);

        // 40 bytes per record, no framing.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 50 * 40);

        cache.clear();
        assert!(cache.is_empty());
        let loaded = cache.load(&path).unwrap();
        assert_eq!(loaded, 50);
        for n in 0..50u32 {
            assert_eq!(cache.pop(&digest(n)), Some(digest(n + 100)));
        }
    }
}
