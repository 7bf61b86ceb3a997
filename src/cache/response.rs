//! Cached response values and cache configuration.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{de_secs, de_secs_opt};
use crate::types::estimate_tokens;

/// Configuration for the tiered cache.
///
/// ```rust
/// # use huginn::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .memory_capacity(5_000)
///     .default_ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory-tier ceiling. Exceeding it evicts the oldest 20%. Default: 10,000.
    pub memory_capacity: usize,
    /// TTL for responses when `set` is called without one. Default: 1 hour.
    #[serde(rename = "default_ttl_secs", deserialize_with = "de_secs")]
    pub default_ttl: Duration,
    /// TTL for persisted pre-generated candidate lists. Default: 24 hours.
    #[serde(rename = "pregen_ttl_secs", deserialize_with = "de_secs")]
    pub pregen_ttl: Duration,
    /// Candidates older than this are dropped by the sweep. Default: 24 hours.
    #[serde(rename = "pattern_retention_secs", deserialize_with = "de_secs")]
    pub pattern_retention: Duration,
    /// Minimum quality (exclusive) for promotion to pre-generated. Default: 0.85.
    pub promotion_threshold: f64,
    /// Pre-generated candidates kept per pattern. Default: 5.
    pub max_candidates: usize,
    /// Sweep period, `None` disables the background sweep. Default: 60s.
    #[serde(rename = "sweep_interval_secs", deserialize_with = "de_secs_opt")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            default_ttl: Duration::from_secs(3600),
            pregen_ttl: Duration::from_secs(24 * 3600),
            pattern_retention: Duration::from_secs(24 * 3600),
            promotion_threshold: 0.85,
            max_candidates: 5,
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_capacity(mut self, n: usize) -> Self {
        self.memory_capacity = n;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn pregen_ttl(mut self, ttl: Duration) -> Self {
        self.pregen_ttl = ttl;
        self
    }

    pub fn pattern_retention(mut self, retention: Duration) -> Self {
        self.pattern_retention = retention;
        self
    }

    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A response stored in either cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub text: String,
    /// Quality in `[0, 1]` as judged when the response was cached.
    pub quality: f64,
    pub token_estimate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl CachedResponse {
    pub fn new(text: impl Into<String>, quality: f64) -> Self {
        let text = text.into();
        Self {
            token_estimate: estimate_tokens(&text),
            text,
            quality: quality.clamp(0.0, 1.0),
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Envelope written to the persistent tier.
///
/// Carries its own expiry so a store that keeps keys past their TTL can
/// never cause a stale read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedResponse {
    pub value: CachedResponse,
    pub expires_at_ms: u64,
}

impl PersistedResponse {
    /// Remaining lifetime, `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = unix_millis();
        (self.expires_at_ms > now).then(|| Duration::from_millis(self.expires_at_ms - now))
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
