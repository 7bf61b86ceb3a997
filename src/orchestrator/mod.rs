//! The resolution cascade.
//!
//! Every turn walks a fixed sequence of stages and stops at the first hit:
//!
//! ```text
//! START → PREDICT → CACHE → TEMPLATE → DISPATCH → DONE
//! ```
//!
//! The first three stages are the fast path and never call upstream. Their
//! failures degrade to a miss. Only `DISPATCH` can fail a turn.
//!
//! The orchestrator also owns the lifecycle of the periodic work the other
//! components need: cache sweeps, pool maintenance, queue draining, stream
//! retuning and learning persistence.

mod background;
mod builder;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use builder::{DEFAULT_MAINTENANCE_INTERVAL, OrchestratorBuilder};

use crate::cache::{PersistentStore, TieredCache};
use crate::dispatch::ParallelDispatcher;
use crate::fingerprint::Fingerprint;
use crate::pool::PoolManager;
use crate::prediction::PredictionEngine;
use crate::stats::{StatsSnapshot, TemplateStats, TurnStats};
use crate::stream::StreamOptimizer;
use crate::template::TemplateMatcher;
use crate::traits::TransportSink;
use crate::types::{
    Message, OutputUnit, PriorityClass, ProcessingRequest, Role, SourceTag, TurnResponse,
};
use crate::version::BuildInfo;
use crate::{HuginnError, Result, telemetry};
use background::Background;

const SOURCES: [SourceTag; 6] = [
    SourceTag::Prediction,
    SourceTag::Cache,
    SourceTag::PreGenerated,
    SourceTag::Template,
    SourceTag::Parallel,
    SourceTag::Upstream,
];

#[derive(Debug, Default)]
struct TurnCounters {
    by_source: [AtomicU64; 6],
    failures: AtomicU64,
}

impl TurnCounters {
    fn record(&self, source: SourceTag) {
        if let Some(i) = SOURCES.iter().position(|s| *s == source) {
            self.by_source[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> TurnStats {
        let by_source: BTreeMap<String, u64> = SOURCES
            .iter()
            .zip(&self.by_source)
            .map(|(s, n)| (s.as_str().to_owned(), n.load(Ordering::Relaxed)))
            .collect();
        let fast: u64 = SOURCES
            .iter()
            .zip(&self.by_source)
            .filter(|(s, _)| s.is_fast_path())
            .map(|(_, n)| n.load(Ordering::Relaxed))
            .sum();
        let total: u64 = by_source.values().sum();
        TurnStats {
            total,
            by_source,
            failures: self.failures.load(Ordering::Relaxed),
            fast_path_rate: if total == 0 {
                0.0
            } else {
                fast as f64 / total as f64
            },
        }
    }
}

/// Answers conversational turns through the cascade.
pub struct Orchestrator {
    store: Arc<dyn PersistentStore>,
    cache: Arc<TieredCache>,
    predictor: Arc<PredictionEngine>,
    templates: TemplateMatcher,
    pools: Arc<PoolManager>,
    dispatcher: Arc<ParallelDispatcher>,
    stream: Arc<StreamOptimizer>,
    maintenance_interval: Duration,
    background: Mutex<Option<Background>>,
    counters: TurnCounters,
    started_at: Instant,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        store: Arc<dyn PersistentStore>,
        cache: Arc<TieredCache>,
        predictor: Arc<PredictionEngine>,
        templates: TemplateMatcher,
        pools: Arc<PoolManager>,
        dispatcher: Arc<ParallelDispatcher>,
        stream: Arc<StreamOptimizer>,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            predictor,
            templates,
            pools,
            dispatcher,
            stream,
            maintenance_interval,
            background: Mutex::new(None),
            counters: TurnCounters::default(),
            started_at: Instant::now(),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn predictor(&self) -> &Arc<PredictionEngine> {
        &self.predictor
    }

    pub fn templates(&self) -> &TemplateMatcher {
        &self.templates
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn dispatcher(&self) -> &Arc<ParallelDispatcher> {
        &self.dispatcher
    }

    pub fn stream(&self) -> &Arc<StreamOptimizer> {
        &self.stream
    }

    /// Answer the last user message of `conversation`.
    pub async fn handle_turn(
        &self,
        conversation: &[Message],
        priority: PriorityClass,
    ) -> Result<TurnResponse> {
        self.handle(&ProcessingRequest::new(conversation.to_vec(), priority))
            .await
    }

    /// Run `request` through the cascade.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a conversation without user input; otherwise only
    /// the dispatcher's fatal errors.
    #[instrument(skip_all, fields(request = request.id, priority = %request.priority))]
    pub async fn handle(&self, request: &ProcessingRequest) -> Result<TurnResponse> {
        let started = Instant::now();
        check_input(request)?;

        if let Some(response) = self.fast_path(request, started).await {
            self.record_turn(response.source, started);
            return Ok(response);
        }

        match self.dispatcher.dispatch(request).await {
            Ok(response) => {
                self.record_turn(response.source, started);
                Ok(response)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dispatch failed");
                Err(e)
            }
        }
    }

    /// Like [`handle_turn`](Self::handle_turn), delivering output to `sink`.
    ///
    /// Fast-path answers arrive as a single `complete` unit. Upstream
    /// answers stream as `chunk` units through the optimizer and end with a
    /// `complete` unit carrying the whole text. A fatal failure ends the
    /// stream with an `error` unit and is also returned.
    pub async fn stream_turn(
        &self,
        conversation: &[Message],
        priority: PriorityClass,
        sink: &dyn TransportSink,
    ) -> Result<TurnResponse> {
        let request = ProcessingRequest::new(conversation.to_vec(), priority);
        let result = self.stream_request(&request, sink).await;
        match &result {
            Ok(response) => sink.push(OutputUnit::complete(&response.text)).await?,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "streamed turn failed");
                sink.push(OutputUnit::error(e.to_string())).await?;
            }
        }
        result
    }

    #[instrument(skip_all, fields(request = request.id, priority = %request.priority))]
    async fn stream_request(
        &self,
        request: &ProcessingRequest,
        sink: &dyn TransportSink,
    ) -> Result<TurnResponse> {
        let started = Instant::now();
        check_input(request)?;

        if let Some(response) = self.fast_path(request, started).await {
            self.record_turn(response.source, started);
            return Ok(response);
        }

        let (fragments, target) = self.dispatcher.dispatch_stream(request).await?;
        let text = self.stream.forward(fragments, sink).await?;
        let validation = self
            .dispatcher
            .record_success(request, &text, &target.provider)
            .await;
        let response = TurnResponse {
            text,
            source: SourceTag::Upstream,
            confidence: validation
                .map_or(self.dispatcher.config().default_quality, |v| v.score),
            provider: Some(target.provider),
            model: Some(target.model),
            latency: started.elapsed(),
            validation,
        };
        self.record_turn(response.source, started);
        Ok(response)
    }

    /// PREDICT, then CACHE, then TEMPLATE. `None` means dispatch.
    async fn fast_path(
        &self,
        request: &ProcessingRequest,
        started: Instant,
    ) -> Option<TurnResponse> {
        let conversation = &request.conversation;
        let input = request.input();
        let prior = conversation
            .iter()
            .rposition(|m| m.role == Role::User)
            .map_or(&conversation[..], |i| &conversation[..i]);

        if let Some(prediction) = self.predictor.predict(input, Some(prior)) {
            debug!(confidence = prediction.confidence, "prediction hit");
            return Some(fast_response(
                prediction.text,
                SourceTag::Prediction,
                prediction.confidence,
                started,
            ));
        }

        let fingerprint = Fingerprint::of(conversation);
        if let Some(hit) = self.cache.get(fingerprint.key()).await {
            debug!(pattern = fingerprint.pattern(), "cache hit");
            let mut response = fast_response(hit.text, SourceTag::Cache, hit.quality, started);
            response.provider = hit.provider;
            return Some(response);
        }
        if let Some(candidate) = self.cache.best_pregenerated(fingerprint.pattern()).await {
            debug!(pattern = fingerprint.pattern(), "pre-generated hit");
            return Some(fast_response(
                candidate.response_text,
                SourceTag::PreGenerated,
                candidate.quality_score,
                started,
            ));
        }

        if let Some(matched) = self.templates.match_input(input, conversation) {
            debug!(rule = %matched.rule, "template hit");
            return Some(fast_response(
                matched.text,
                SourceTag::Template,
                matched.estimated_authenticity,
                started,
            ));
        }
        None
    }

    fn record_turn(&self, source: SourceTag, started: Instant) {
        self.counters.record(source);
        metrics::counter!(telemetry::TURNS_TOTAL, "stage" => source.as_str()).increment(1);
        metrics::histogram!(telemetry::TURN_DURATION_SECONDS, "stage" => source.as_str())
            .record(started.elapsed().as_secs_f64());
    }

    /// Restore learned state, warm keep-alive pools, and start background
    /// tasks. Calling it again while running does nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.background_running() {
            return;
        }
        let restored = self.predictor.restore(self.store.as_ref()).await;
        let warmed = self.pools.warm_up().await;
        info!(restored, opened = warmed.opened, "orchestrator starting");

        let mut background = Background::new();
        if let Some(every) = self.cache.config().sweep_interval {
            let cache = Arc::clone(&self.cache);
            background.every("cache_sweep", every, move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.sweep().await;
                }
            });
        }
        {
            let this = Arc::clone(self);
            background.every("pool_maintenance", self.maintenance_interval, move || {
                let this = Arc::clone(&this);
                async move {
                    this.pools.maintain().await;
                    this.retune_stream();
                }
            });
        }
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let every = dispatcher.config().queue_drain_interval;
            background.every("queue_drain", every, move || {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    dispatcher.drain_queues();
                }
            });
        }
        if let Some(every) = self.predictor.config().persist_interval {
            let predictor = Arc::clone(&self.predictor);
            let store = Arc::clone(&self.store);
            background.every("prediction_persist", every, move || {
                let predictor = Arc::clone(&predictor);
                let store = Arc::clone(&store);
                async move {
                    predictor.persist(store.as_ref()).await;
                }
            });
        }

        debug!(tasks = background.len(), "background tasks started");
        let previous = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(background);
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    /// Stop background tasks, save learned state, and drain every pool.
    ///
    /// Returns `false` if some connections were still checked out when
    /// `drain_timeout` elapsed.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(background) = background {
            background.stop().await;
        }
        let saved = self.predictor.persist(self.store.as_ref()).await;
        let drained = self.pools.drain(drain_timeout).await;
        info!(saved, drained, "orchestrator stopped");
        drained
    }

    pub fn background_running(&self) -> bool {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Retune the stream optimizer from the mean provider latency.
    fn retune_stream(&self) {
        let latencies = self.pools.latency().snapshot();
        let mean = (!latencies.is_empty())
            .then(|| latencies.values().sum::<f64>() / latencies.len() as f64)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0));
        self.stream.retune(mean);
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (hits, misses) = self.templates.counts();
        StatsSnapshot {
            build: BuildInfo::current(),
            uptime: self.started_at.elapsed(),
            turns: self.counters.snapshot(),
            cache: self.cache.stats(),
            prediction: self.predictor.stats(),
            templates: TemplateStats { hits, misses },
            pools: self.pools.stats(),
            latency_ms: self.pools.latency().snapshot().into_iter().collect(),
            dispatcher: self.dispatcher.stats(),
            stream: self.stream.stats(),
        }
    }
}

fn check_input(request: &ProcessingRequest) -> Result<()> {
    if request.input().trim().is_empty() {
        return Err(HuginnError::InvalidInput(
            "conversation has no user input".into(),
        ));
    }
    Ok(())
}

fn fast_response(
    text: String,
    source: SourceTag,
    confidence: f64,
    started: Instant,
) -> TurnResponse {
    TurnResponse {
        text,
        source,
        confidence,
        provider: None,
        model: None,
        latency: started.elapsed(),
        validation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_rate_counts_only_local_stages() {
        let counters = TurnCounters::default();
        counters.record(SourceTag::Prediction);
        counters.record(SourceTag::Template);
        counters.record(SourceTag::Cache);
        counters.record(SourceTag::Upstream);

        let stats = counters.snapshot();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_source["template"], 1);
        assert_eq!(stats.by_source["parallel"], 0);
        assert!((stats.fast_path_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_counters_report_zero_rate() {
        let stats = TurnCounters::default().snapshot();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.fast_path_rate, 0.0);
    }

    #[test]
    fn blank_input_is_rejected() {
        let request = ProcessingRequest::new(vec![Message::user("   ")], PriorityClass::Normal);
        assert!(matches!(
            check_input(&request),
            Err(HuginnError::InvalidInput(_))
        ));
        let request = ProcessingRequest::new(vec![Message::user("hi")], PriorityClass::Normal);
        assert!(check_input(&request).is_ok());
    }
}
