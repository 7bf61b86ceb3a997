//! Tiered response cache.
//!
//! Two tiers sit behind one contract:
//!
//! - a memory tier ([`memory`]) owned by this process, bounded by
//!   [`CacheConfig::memory_capacity`] with insertion-order eviction;
//! - a persistent tier ([`PersistentStore`]) shared with other processes.
//!
//! Reads check memory first and repopulate it from the persistent tier on a
//! miss. Writes go to both tiers. The persistent tier is fail-open: store
//! errors are logged, counted, and reported to callers as plain misses.
//!
//! The cache also keeps up to [`CacheConfig::max_candidates`] ranked
//! [`PreGeneratedCandidate`]s per conversation pattern, fed only by
//! responses whose quality clears [`CacheConfig::promotion_threshold`].

mod memory;
pub mod pregen;
pub mod response;
pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

pub use memory::CacheEntry;
pub use pregen::PreGeneratedCandidate;
pub use response::{CacheConfig, CachedResponse};
pub use store::{InMemoryStore, PersistentStore};

use crate::fingerprint::content_key;
use crate::telemetry;
use crate::HuginnError;
use memory::MemoryTier;
use pregen::{insert_ranked, retain_fresh};
use response::{PersistedResponse, unix_millis};

const RESPONSE_PREFIX: &str = "resp:";
const PREGEN_PREFIX: &str = "pregen:";

/// Counters exposed through [`TieredCache::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_entries: usize,
    pub pattern_count: usize,
    pub evictions: u64,
    pub store_errors: u64,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub stale_candidates: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    store_errors: AtomicU64,
}

/// Memory tier backed by a shared persistent tier.
pub struct TieredCache {
    memory: Mutex<MemoryTier>,
    patterns: Mutex<HashMap<String, Vec<PreGeneratedCandidate>>>,
    store: Arc<dyn PersistentStore>,
    config: CacheConfig,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(config.memory_capacity)),
            patterns: Mutex::new(HashMap::new()),
            store,
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a response by key.
    ///
    /// Never returns an expired entry from either tier.
    #[instrument(skip(self), fields(operation = "cache_get"))]
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let hit = self.lock_memory().get(key, Instant::now());
        if let Some(value) = hit {
            self.record_hit(&self.counters.memory_hits, "memory");
            return Some(value);
        }

        if let Some(value) = self.fetch_persistent(key).await {
            self.record_hit(&self.counters.persistent_hits, "persistent");
            return Some(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        None
    }

    /// Write a response to both tiers. `None` uses the configured default TTL.
    #[instrument(skip(self, value), fields(operation = "cache_set"))]
    pub async fn set(&self, key: &str, value: CachedResponse, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.insert_memory(key, value.clone(), ttl);

        let envelope = PersistedResponse {
            value,
            expires_at_ms: unix_millis() + ttl.as_millis() as u64,
        };
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                let stored = self
                    .store
                    .set_with_ttl(&response_key(key), bytes, ttl)
                    .await;
                if let Err(e) = stored {
                    self.store_error("set", &e);
                }
            }
            Err(e) => warn!(error = %e, "failed to encode cache entry"),
        }
    }

    /// Look up many keys at once; only hits appear in the returned map.
    #[instrument(skip(self, keys), fields(operation = "cache_batch_get", batch_size = keys.len()))]
    pub async fn batch_get(&self, keys: &[&str]) -> HashMap<String, CachedResponse> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        {
            let now = Instant::now();
            let mut memory = self.lock_memory();
            for key in keys {
                match memory.get(key, now) {
                    Some(value) => {
                        found.insert((*key).to_owned(), value);
                    }
                    None => missing.push(*key),
                }
            }
        }
        if !found.is_empty() {
            self.counters
                .memory_hits
                .fetch_add(found.len() as u64, Ordering::Relaxed);
        }
        if missing.is_empty() {
            return found;
        }

        let store_keys: Vec<String> = missing.iter().map(|k| response_key(k)).collect();
        let values = match self.store.mget(&store_keys).await {
            Ok(values) => values,
            Err(e) => {
                self.store_error("mget", &e);
                vec![None; missing.len()]
            }
        };

        for (key, bytes) in missing.into_iter().zip(values) {
            match bytes.and_then(|b| self.decode_live(key, &b)) {
                Some(value) => {
                    self.record_hit(&self.counters.persistent_hits, "persistent");
                    found.insert(key.to_owned(), value);
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                }
            }
        }
        found
    }

    /// Offer a response as a pre-generated candidate for `pattern`.
    ///
    /// Only responses with `quality` above the promotion threshold are kept.
    /// Returns whether the candidate list changed; repeating the same call
    /// returns `false` and leaves the cache untouched.
    #[instrument(skip(self, response), fields(operation = "cache_pattern"))]
    pub async fn cache_response_pattern(&self, pattern: &str, response: &str, quality: f64) -> bool {
        if quality <= self.config.promotion_threshold {
            return false;
        }
        let pattern_key = content_key(pattern);

        // Seed from the shared tier before the first local insertion so other
        // processes' candidates are not overwritten.
        let known = self.lock_patterns().contains_key(&pattern_key);
        let loaded = if known {
            None
        } else {
            Some(self.fetch_candidates(&pattern_key).await)
        };

        let updated = {
            let mut patterns = self.lock_patterns();
            let list = patterns.entry(pattern_key.clone()).or_default();
            if let Some(loaded) = loaded {
                for candidate in loaded {
                    insert_ranked(list, candidate, self.config.max_candidates);
                }
            }
            let candidate = PreGeneratedCandidate::new(pattern, response, quality);
            if insert_ranked(list, candidate, self.config.max_candidates) {
                Some(list.clone())
            } else {
                None
            }
        };

        match updated {
            Some(list) => {
                debug!(candidates = list.len(), "promoted pre-generated candidate");
                self.persist_candidates(&pattern_key, &list).await;
                true
            }
            None => false,
        }
    }

    /// Ranked candidates for a pattern, best first.
    pub async fn pregenerated(&self, pattern: &str) -> Vec<PreGeneratedCandidate> {
        let pattern_key = content_key(pattern);
        let known = self.lock_patterns().get(&pattern_key).cloned();
        if let Some(list) = known {
            return list;
        }

        let loaded = self.fetch_candidates(&pattern_key).await;
        if !loaded.is_empty() {
            self.lock_patterns()
                .entry(pattern_key)
                .or_insert_with(|| loaded.clone());
        }
        loaded
    }

    /// Highest-ranked candidate for a pattern.
    pub async fn best_pregenerated(&self, pattern: &str) -> Option<PreGeneratedCandidate> {
        self.pregenerated(pattern).await.into_iter().next()
    }

    /// Remove expired memory entries and candidates past retention in both tiers.
    #[instrument(skip(self), fields(operation = "cache_sweep"))]
    pub async fn sweep(&self) -> SweepReport {
        let now_ms = unix_millis();
        let retention = self.config.pattern_retention;
        let mut report = SweepReport {
            expired_entries: self.lock_memory().sweep(Instant::now()),
            ..Default::default()
        };
        {
            let mut patterns = self.lock_patterns();
            for list in patterns.values_mut() {
                report.stale_candidates += retain_fresh(list, retention, now_ms);
            }
            patterns.retain(|_, list| !list.is_empty());
        }

        let keys = match self.store.scan_prefix(PREGEN_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                self.store_error("scan_prefix", &e);
                return report;
            }
        };
        if keys.is_empty() {
            return report;
        }
        let values = match self.store.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                self.store_error("mget", &e);
                return report;
            }
        };

        for (key, bytes) in keys.iter().zip(values) {
            let Some(bytes) = bytes else { continue };
            let Ok(mut list) = serde_json::from_slice::<Vec<PreGeneratedCandidate>>(&bytes) else {
                warn!(key = %key, "dropping undecodable candidate list");
                if let Err(e) = self.store.delete(key).await {
                    self.store_error("delete", &e);
                }
                continue;
            };
            let removed = retain_fresh(&mut list, retention, now_ms);
            if removed == 0 {
                continue;
            }
            report.stale_candidates += removed;
            let result = if list.is_empty() {
                self.store.delete(key).await
            } else {
                match serde_json::to_vec(&list) {
                    Ok(bytes) => {
                        self.store
                            .set_with_ttl(key, bytes, self.config.pregen_ttl)
                            .await
                    }
                    Err(e) => Err(HuginnError::from(e)),
                }
            };
            if let Err(e) = result {
                self.store_error("sweep_write", &e);
            }
        }

        if report != SweepReport::default() {
            debug!(
                expired = report.expired_entries,
                stale = report.stale_candidates,
                "cache sweep"
            );
        }
        report
    }

    /// Snapshot of hit/miss counters and tier sizes.
    pub fn stats(&self) -> CacheStats {
        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.counters.persistent_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = memory_hits + persistent_hits + misses;
        CacheStats {
            memory_hits,
            persistent_hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (memory_hits + persistent_hits) as f64 / lookups as f64
            },
            memory_entries: self.lock_memory().len(),
            pattern_count: self.lock_patterns().len(),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn fetch_persistent(&self, key: &str) -> Option<CachedResponse> {
        match self.store.get(&response_key(key)).await {
            Ok(Some(bytes)) => self.decode_live(key, &bytes),
            Ok(None) => None,
            Err(e) => {
                self.store_error("get", &e);
                None
            }
        }
    }

    /// Decode a persisted envelope and, if still live, repopulate memory.
    fn decode_live(&self, key: &str, bytes: &[u8]) -> Option<CachedResponse> {
        let envelope: PersistedResponse = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key, error = %e, "undecodable persistent cache entry");
                return None;
            }
        };
        let remaining = envelope.remaining()?;
        self.insert_memory(key, envelope.value.clone(), remaining);
        Some(envelope.value)
    }

    fn insert_memory(&self, key: &str, value: CachedResponse, ttl: Duration) {
        let evicted = self.lock_memory().insert(key, value, ttl, Instant::now());
        if evicted > 0 {
            debug!(evicted, "memory tier over capacity");
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(evicted as u64);
        }
    }

    async fn fetch_candidates(&self, pattern_key: &str) -> Vec<PreGeneratedCandidate> {
        match self.store.get(&pregen_key(pattern_key)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "undecodable candidate list");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                self.store_error("get", &e);
                Vec::new()
            }
        }
    }

    async fn persist_candidates(&self, pattern_key: &str, list: &[PreGeneratedCandidate]) {
        let bytes = match serde_json::to_vec(list) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode candidate list");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_with_ttl(&pregen_key(pattern_key), bytes, self.config.pregen_ttl)
            .await
        {
            self.store_error("set", &e);
        }
    }

    fn record_hit(&self, counter: &AtomicU64, tier: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
    }

    fn store_error(&self, operation: &'static str, error: &HuginnError) {
        warn!(operation, error = %error, "persistent tier error treated as miss");
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_patterns(&self) -> MutexGuard<'_, HashMap<String, Vec<PreGeneratedCandidate>>> {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn response_key(key: &str) -> String {
    format!("{RESPONSE_PREFIX}{key}")
}

fn pregen_key(pattern_key: &str) -> String {
    format!("{PREGEN_PREFIX}{pattern_key}")
}
