//! Per-provider latency tracking.
//!
//! [`ProviderLatency`] keeps an exponentially weighted moving average (EWMA)
//! of upstream call durations. [`LatencyBoard`] holds one tracker per
//! provider and orders race targets fastest-first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Default EWMA smoothing factor.
pub const DEFAULT_ALPHA: f64 = 0.2;

/// Lock-free EWMA latency tracker.
///
/// The average is stored as `f64` bits in an `AtomicU64`; `NaN` means no
/// observation yet, so the first sample initialises the average without a
/// separate flag.
pub struct ProviderLatency {
    ewma_micros: AtomicU64,
    alpha: f64,
    count: AtomicU64,
}

impl ProviderLatency {
    pub fn new(alpha: f64) -> Self {
        Self {
            ewma_micros: AtomicU64::new(f64::NAN.to_bits()),
            alpha: alpha.clamp(0.0, 1.0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        let sample = duration.as_micros() as f64;
        let alpha = self.alpha;
        let _ = self
            .ewma_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if current.is_nan() {
                    sample
                } else {
                    alpha * sample + (1.0 - alpha) * current
                };
                Some(next.to_bits())
            });
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current estimate, `None` before the first observation.
    pub fn average(&self) -> Option<Duration> {
        let micros = f64::from_bits(self.ewma_micros.load(Ordering::Relaxed));
        (!micros.is_nan()).then(|| Duration::from_micros(micros as u64))
    }

    pub fn observation_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for ProviderLatency {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl std::fmt::Debug for ProviderLatency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLatency")
            .field("average", &self.average())
            .field("count", &self.observation_count())
            .field("alpha", &self.alpha)
            .finish()
    }
}

/// Latency trackers keyed by provider name.
#[derive(Debug, Default)]
pub struct LatencyBoard {
    trackers: RwLock<HashMap<String, Arc<ProviderLatency>>>,
}

impl LatencyBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, duration: Duration) {
        self.tracker(provider).record(duration);
    }

    pub fn average(&self, provider: &str) -> Option<Duration> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .and_then(|t| t.average())
    }

    /// Every provider's current average, in milliseconds.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(name, t)| Some((name.clone(), t.average()?.as_secs_f64() * 1000.0)))
            .collect()
    }

    /// Stable-sort items so unmeasured providers come first (in their
    /// original order), then measured ones fastest-first.
    pub fn order_fastest<T>(&self, items: &mut [T], provider_of: impl Fn(&T) -> &str) {
        items.sort_by_key(|item| match self.average(provider_of(item)) {
            None => (0, Duration::ZERO),
            Some(avg) => (1, avg),
        });
    }

    fn tracker(&self, provider: &str) -> Arc<ProviderLatency> {
        if let Some(t) = self
            .trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
        {
            return Arc::clone(t);
        }
        Arc::clone(
            self.trackers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(provider.to_owned())
                .or_default(),
        )
    }
}
