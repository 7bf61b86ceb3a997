//! Output batching for streamed completions.
//!
//! Upstream fragments are small and irregular. The optimizer coalesces them
//! into [`OutputUnit::chunk`] units, flushing a batch when it holds
//! `batch_size` fragments, reaches `buffer_bytes`, or has been open for
//! `batch_timeout`, whichever comes first. Each batch is normalized before
//! it leaves.
//!
//! Batch parameters are retuned from observed upstream latency and stream
//! throughput by [`StreamOptimizer::retune`].

pub mod normalize;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::config::de_millis;
use crate::providers::FragmentStream;
use crate::traits::TransportSink;
use crate::types::OutputUnit;
use crate::{Result, telemetry};
pub use normalize::{DEFAULT_FILLERS, normalize};

/// Stream optimizer settings.
///
/// `batch_size`, `batch_timeout` and `buffer_bytes` are starting values;
/// adaptive tuning moves them within the `min_*`/`max_*` bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Fragments per batch. Default: 5.
    pub batch_size: usize,
    /// Longest a batch stays open. Default: 50ms.
    #[serde(rename = "batch_timeout_ms", deserialize_with = "de_millis")]
    pub batch_timeout: Duration,
    /// Byte ceiling of a batch. Default: 1024.
    pub buffer_bytes: usize,
    /// Phrases removed from output, matched on whole words.
    pub filler_phrases: Vec<String>,
    /// Retune batch parameters from observed latency. Default: true.
    pub adaptive: bool,
    /// Upstream latency above which batches grow. Default: 800ms.
    #[serde(rename = "high_latency_ms", deserialize_with = "de_millis")]
    pub high_latency: Duration,
    /// Fragments per second below which batches shrink. Default: 10.
    pub low_throughput: f64,
    pub max_batch_size: usize,
    pub max_buffer_bytes: usize,
    #[serde(rename = "min_batch_timeout_ms", deserialize_with = "de_millis")]
    pub min_batch_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout: Duration::from_millis(50),
            buffer_bytes: 1024,
            filler_phrases: DEFAULT_FILLERS.iter().map(|s| s.to_string()).collect(),
            adaptive: true,
            high_latency: Duration::from_millis(800),
            low_throughput: 10.0,
            max_batch_size: 32,
            max_buffer_bytes: 16 * 1024,
            min_batch_timeout: Duration::from_millis(10),
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn buffer_bytes(mut self, n: usize) -> Self {
        self.buffer_bytes = n;
        self
    }

    pub fn adaptive(mut self, enabled: bool) -> Self {
        self.adaptive = enabled;
        self
    }
}

/// Current batch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tuning {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub buffer_bytes: usize,
}

/// Running counters.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub streams: u64,
    pub fragments: u64,
    pub bytes: u64,
    pub flushes: u64,
    /// Total time spent streaming.
    pub elapsed: Duration,
    pub fragments_per_sec: f64,
    pub tuning: Tuning,
}

/// One open batch.
#[derive(Debug)]
pub struct StreamBatch {
    tuning: Tuning,
    buffer: String,
    fragments: usize,
    opened_at: Option<Instant>,
}

impl StreamBatch {
    pub fn new(tuning: Tuning) -> Self {
        Self {
            tuning,
            buffer: String::new(),
            fragments: 0,
            opened_at: None,
        }
    }

    /// Add a fragment. Returns the raw batch if a size trigger fired.
    pub fn push(&mut self, fragment: &str, now: Instant) -> Option<String> {
        self.opened_at.get_or_insert(now);
        self.buffer.push_str(fragment);
        self.fragments += 1;
        if self.fragments >= self.tuning.batch_size
            || self.buffer.len() >= self.tuning.buffer_bytes
        {
            return self.take();
        }
        None
    }

    /// When the open batch must be flushed, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.tuning.batch_timeout)
    }

    /// Flush the batch if its time window has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<String> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// Close the batch, returning whatever it holds.
    pub fn take(&mut self) -> Option<String> {
        self.opened_at = None;
        self.fragments = 0;
        (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer))
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Coalesces fragment streams into transport chunks.
#[derive(Debug)]
pub struct StreamOptimizer {
    config: StreamConfig,
    tuning: Mutex<Tuning>,
    streams: AtomicU64,
    fragments: AtomicU64,
    bytes: AtomicU64,
    flushes: AtomicU64,
    elapsed_micros: AtomicU64,
}

impl Default for StreamOptimizer {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl StreamOptimizer {
    pub fn new(config: StreamConfig) -> Self {
        let tuning = Tuning {
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout,
            buffer_bytes: config.buffer_bytes.max(1),
        };
        Self {
            config,
            tuning: Mutex::new(tuning),
            streams: AtomicU64::new(0),
            fragments: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            elapsed_micros: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn tuning(&self) -> Tuning {
        *self.tuning.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a batch with the current tuning.
    pub fn batch(&self) -> StreamBatch {
        StreamBatch::new(self.tuning())
    }

    /// Normalize a raw batch for delivery.
    pub fn clean(&self, raw: &str) -> String {
        normalize(raw, &self.config.filler_phrases)
    }

    /// Forward `stream` to `sink` as batched chunks.
    ///
    /// Returns the delivered text. An upstream error is returned after the
    /// pending batch has been flushed; the caller decides how to report it.
    #[instrument(skip_all)]
    pub async fn forward(
        &self,
        mut stream: FragmentStream,
        sink: &dyn TransportSink,
    ) -> Result<String> {
        let started = Instant::now();
        self.streams.fetch_add(1, Ordering::Relaxed);
        let mut batch = self.batch();
        let mut delivered = String::new();

        let outcome = loop {
            let next = match batch.deadline() {
                Some(deadline) => tokio::select! {
                    item = stream.next() => Some(item),
                    _ = tokio::time::sleep_until(deadline) => None,
                },
                None => Some(stream.next().await),
            };
            match next {
                None => {
                    if let Some(raw) = batch.take() {
                        self.emit(sink, &raw, &mut delivered).await?;
                    }
                }
                Some(Some(Ok(fragment))) => {
                    self.fragments.fetch_add(1, Ordering::Relaxed);
                    self.bytes
                        .fetch_add(fragment.len() as u64, Ordering::Relaxed);
                    if let Some(raw) = batch.push(&fragment, Instant::now()) {
                        self.emit(sink, &raw, &mut delivered).await?;
                    }
                }
                Some(Some(Err(e))) => break Err(e),
                Some(None) => break Ok(()),
            }
        };

        if let Some(raw) = batch.take() {
            self.emit(sink, &raw, &mut delivered).await?;
        }
        self.elapsed_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        outcome.map(|()| delivered.trim().to_owned())
    }

    async fn emit(
        &self,
        sink: &dyn TransportSink,
        raw: &str,
        delivered: &mut String,
    ) -> Result<()> {
        let cleaned = self.clean(raw);
        if cleaned.trim().is_empty() && delivered.is_empty() {
            return Ok(());
        }
        delivered.push_str(&cleaned);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::STREAM_FLUSHES_TOTAL).increment(1);
        sink.push(OutputUnit::chunk(cleaned)).await
    }

    pub fn fragments_per_sec(&self) -> f64 {
        let micros = self.elapsed_micros.load(Ordering::Relaxed);
        if micros == 0 {
            return 0.0;
        }
        self.fragments.load(Ordering::Relaxed) as f64 / (micros as f64 / 1_000_000.0)
    }

    /// Adjust batch parameters.
    ///
    /// High upstream latency grows the batch and its buffer, since fragments
    /// arrive in bursts anyway. Low throughput shrinks the batch and its
    /// timeout so sparse fragments are not held back. Returns the new tuning.
    pub fn retune(&self, upstream_latency: Option<Duration>) -> Tuning {
        let mut tuning = self.tuning.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.config.adaptive {
            return *tuning;
        }
        let throughput = self.fragments_per_sec();
        let before = *tuning;

        if upstream_latency.is_some_and(|l| l > self.config.high_latency) {
            let max_batch = self.config.max_batch_size.max(1);
            let max_buffer = self.config.max_buffer_bytes.max(1);
            tuning.batch_size = (tuning.batch_size + 2).min(max_batch);
            tuning.buffer_bytes = (tuning.buffer_bytes + tuning.buffer_bytes / 2).min(max_buffer);
        } else if throughput > 0.0 && throughput < self.config.low_throughput {
            tuning.batch_size = tuning.batch_size.saturating_sub(1).max(1);
            tuning.batch_timeout = tuning
                .batch_timeout
                .mul_f64(0.75)
                .max(self.config.min_batch_timeout);
        }

        if *tuning != before {
            debug!(
                batch_size = tuning.batch_size,
                batch_timeout_ms = tuning.batch_timeout.as_millis() as u64,
                buffer_bytes = tuning.buffer_bytes,
                throughput,
                "stream tuning changed"
            );
        }
        *tuning
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            streams: self.streams.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            elapsed: Duration::from_micros(self.elapsed_micros.load(Ordering::Relaxed)),
            fragments_per_sec: self.fragments_per_sec(),
            tuning: self.tuning(),
        }
    }
}
