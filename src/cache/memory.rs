//! In-process cache tier.
//!
//! Eviction is by insertion order: when the tier grows past its ceiling the
//! oldest-inserted 20% of entries are removed, regardless of how recently
//! they were read. Re-inserting a key counts as a fresh insertion.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use super::response::CachedResponse;

/// A memory-tier entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedResponse,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
    seq: u64,
}

impl CacheEntry {
    /// Expired once `now > created_at + ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.created_at + self.ttl
    }
}

#[derive(Debug)]
pub(crate) struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    /// Insertion sequence → key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up a live entry, bumping its hit count. Expired entries are
    /// removed on the spot.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<CachedResponse> {
        let expired = match self.entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.hit_count += 1;
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.remove(key);
        }
        None
    }

    /// Insert or replace an entry. Returns how many entries were evicted.
    pub fn insert(
        &mut self,
        key: &str,
        value: CachedResponse,
        ttl: Duration,
        now: Instant,
    ) -> usize {
        self.remove(key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.to_owned());
        self.entries.insert(
            key.to_owned(),
            CacheEntry {
                key: key.to_owned(),
                value,
                created_at: now,
                ttl,
                hit_count: 0,
                seq,
            },
        );

        if self.entries.len() > self.capacity {
            self.evict_oldest()
        } else {
            0
        }
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Inspect an entry without counting a hit.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
        }
    }

    fn evict_oldest(&mut self) -> usize {
        let count = (self.entries.len() / 5).max(1);
        let victims: Vec<String> = self.order.values().take(count).cloned().collect();
        for key in &victims {
            self.remove(key);
        }
        victims.len()
    }
}
