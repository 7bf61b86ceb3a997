//! Persistent (shared) cache tier contract.
//!
//! The persistent tier is an external collaborator, typically a networked
//! key/value store shared by several processes. Every method may fail with
//! [`HuginnError::StoreUnavailable`]; callers in this crate treat such
//! failures as cache misses and never propagate them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{HuginnError, Result};

/// Byte-oriented key/value store with per-key TTL.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Fetch a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Fetch many values; the result is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// List live keys starting with `prefix`. Order is unspecified.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process [`PersistentStore`] used as the default tier and in tests.
///
/// Honors TTLs lazily on read. [`set_available`](Self::set_available)
/// simulates an outage: while unavailable every call fails with
/// `StoreUnavailable`.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(HuginnError::StoreUnavailable("in-memory store offline".into()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(entries: &HashMap<String, (Vec<u8>, Instant)>, key: &str) -> Option<Vec<u8>> {
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(bytes, _)| bytes.clone())
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(Self::live(&self.lock(), key))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check()?;
        self.lock()
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check()?;
        let entries = self.lock();
        Ok(keys.iter().map(|k| Self::live(&entries, k)).collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(k, (_, expires))| k.starts_with(prefix) && *expires > now)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }
}
