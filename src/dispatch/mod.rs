//! Parallel dispatch of upstream calls.
//!
//! Two paths lead upstream:
//!
//! - `ultra` requests race: the same call goes to several providers at once
//!   (fastest-measured first) and the first success wins. Losing calls run
//!   to completion in their own tasks; their results are ignored.
//! - every other class goes to one provider through its admission queue and
//!   is retried on transient failures.
//!
//! All upstream calls, race legs included, pass through the per-provider
//! admission queue, so a provider never has more calls in flight than its
//! pool capacity and waiters run in priority order.
//!
//! Successful responses are validated (when a validator is configured) and
//! fed back into the tiered cache and the prediction engine.

mod queue;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CachedResponse, TieredCache};
use crate::config::de_millis;
use crate::fingerprint::Fingerprint;
use crate::pool::PoolManager;
use crate::prediction::PredictionEngine;
use crate::providers::retry::with_retry;
use crate::providers::{CompletionRequest, FragmentStream, RetryConfig};
use crate::traits::ResponseValidator;
use crate::types::{
    ModelTarget, PriorityClass, ProcessingRequest, SourceTag, TurnResponse, Validation,
};
use crate::{HuginnError, Result, telemetry};
use queue::{Admission, Admit, WorkQueues};

const DEFAULT_ADMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Priority classes the queues keep distinct, counted from `ultra` down.
    /// Lower classes share the lowest honoured rank. Default: 4.
    pub priority_levels: usize,
    /// Providers raced for an `ultra` request. Default: 3.
    pub ultra_race_fanout: usize,
    /// Interval of the background pass that admits queued calls. Default: 50ms.
    #[serde(rename = "queue_drain_interval_ms", deserialize_with = "de_millis")]
    pub queue_drain_interval: Duration,
    /// Provider for requests without a target. Default: first registered.
    pub default_provider: Option<String>,
    /// Quality assumed for responses when no validator is configured.
    pub default_quality: f64,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            priority_levels: 4,
            ultra_race_fanout: 3,
            queue_drain_interval: Duration::from_millis(50),
            default_provider: None,
            default_quality: 0.9,
            max_tokens: None,
            temperature: None,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ultra_race_fanout(mut self, n: usize) -> Self {
        self.ultra_race_fanout = n;
        self
    }

    pub fn priority_levels(mut self, n: usize) -> Self {
        self.priority_levels = n;
        self
    }

    pub fn default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }
}

/// Dispatcher counters and queue state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub races: u64,
    pub race_failures: u64,
    pub queued_failures: u64,
    pub batches: u64,
    pub rejected_by_validator: u64,
    pub queue_depths: BTreeMap<String, usize>,
    pub in_flight: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    races: AtomicU64,
    race_failures: AtomicU64,
    queued_failures: AtomicU64,
    batches: AtomicU64,
    rejected: AtomicU64,
}

/// The parts of the dispatcher a detached race leg needs.
#[derive(Clone)]
struct Upstream {
    pools: Arc<PoolManager>,
    queues: Arc<WorkQueues>,
}

impl Upstream {
    /// Wait for a slot on `target.provider`, at most the provider's
    /// acquire timeout.
    async fn admit(&self, target: &ModelTarget, priority: PriorityClass) -> Result<Admission> {
        let (capacity, waited) = self
            .pools
            .profile(&target.provider)
            .map_or((1, DEFAULT_ADMIT_TIMEOUT), |p| {
                (p.max_connections, p.acquire_timeout)
            });
        let mut rx = match self.queues.admit(&target.provider, capacity, priority) {
            Admit::Now(admission) => return Ok(admission),
            Admit::Queued(rx) => rx,
        };
        match tokio::time::timeout(waited, &mut rx).await {
            Ok(Ok(admission)) => Ok(admission),
            Ok(Err(_)) => Err(HuginnError::Cancelled),
            Err(_) => {
                // An admission may have been sent right at the deadline.
                rx.close();
                if let Ok(admission) = rx.try_recv() {
                    return Ok(admission);
                }
                metrics::counter!(
                    telemetry::POOL_TIMEOUTS_TOTAL,
                    "provider" => target.provider.clone()
                )
                .increment(1);
                warn!(
                    provider = %target.provider,
                    waited_ms = waited.as_millis() as u64,
                    "admission queue wait timed out"
                );
                Err(HuginnError::PoolTimeout {
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    waited,
                })
            }
        }
    }

    async fn complete(
        &self,
        target: &ModelTarget,
        priority: PriorityClass,
        request: CompletionRequest,
    ) -> Result<String> {
        let _admission = self.admit(target, priority).await?;
        self.pools
            .execute(&target.provider, &target.model, priority, |conn| async move {
                conn.complete(&request).await.map(|c| c.text)
            })
            .await
    }
}

/// Races, queues and batches upstream calls through the pool.
pub struct ParallelDispatcher {
    config: DispatcherConfig,
    retry: RetryConfig,
    upstream: Upstream,
    cache: Arc<TieredCache>,
    predictor: Arc<PredictionEngine>,
    validator: Option<Arc<dyn ResponseValidator>>,
    counters: Counters,
}

impl ParallelDispatcher {
    pub fn new(
        config: DispatcherConfig,
        pools: Arc<PoolManager>,
        cache: Arc<TieredCache>,
        predictor: Arc<PredictionEngine>,
    ) -> Self {
        Self {
            upstream: Upstream {
                pools,
                queues: WorkQueues::new(config.priority_levels),
            },
            config,
            retry: RetryConfig::default(),
            cache,
            predictor,
            validator: None,
            counters: Counters::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.upstream.pools
    }

    /// Resolve one request upstream.
    ///
    /// Fails with `NotConfigured`, `AllProvidersFailed`, `PoolTimeout` when
    /// every raced provider stayed saturated past its acquire timeout, or the
    /// last error of an exhausted retry loop.
    #[instrument(skip_all, fields(request = request.id, priority = %request.priority))]
    pub async fn dispatch(&self, request: &ProcessingRequest) -> Result<TurnResponse> {
        let started = Instant::now();
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let (mut text, mut target, source) = self.resolve(request).await?;
        let mut validation = self.validate(request, &text).await;

        if let Some(v) = validation.filter(|v| !v.is_valid && v.should_retry) {
            debug!(score = v.score, "validator asked for a retry");
            if let Ok((retry_text, retry_target, _)) = self.resolve(request).await {
                text = retry_text;
                target = retry_target;
                validation = self.validate(request, &text).await;
            }
        }

        let quality = validation.map_or(self.config.default_quality, |v| v.score);
        if validation.is_none_or(|v| v.is_valid) {
            self.feed_back(request, &text, &target.provider, quality).await;
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(provider = %target.provider, "response rejected by validator; not cached");
        }

        Ok(TurnResponse {
            text,
            source,
            confidence: quality,
            provider: Some(target.provider),
            model: Some(target.model),
            latency: started.elapsed(),
            validation,
        })
    }

    /// Resolve many requests together.
    ///
    /// Results come back in input order. Each request goes through
    /// [`dispatch`](Self::dispatch), so races and queue order still apply.
    pub async fn dispatch_batch(
        &self,
        requests: &[ProcessingRequest],
    ) -> Vec<Result<TurnResponse>> {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        futures_util::future::join_all(requests.iter().map(|r| self.dispatch(r))).await
    }

    /// Start a streamed completion for `request` on one provider.
    ///
    /// The admission slot and the pooled connection are held until the
    /// stream ends or is dropped. Nothing is fed back; callers report the
    /// assembled text through [`record_success`](Self::record_success).
    #[instrument(skip_all, fields(request = request.id, priority = %request.priority))]
    pub async fn dispatch_stream(
        &self,
        request: &ProcessingRequest,
    ) -> Result<(FragmentStream, ModelTarget)> {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let target = self.primary_target(request)?;
        let admission = self.upstream.admit(&target, request.priority).await?;
        let stream = self
            .upstream
            .pools
            .execute_stream(
                &target.provider,
                request.priority,
                &self.completion_request(request, &target.model),
            )
            .await?;
        // The admission lives as long as the stream does.
        let stream = stream.map(move |item| {
            let _ = admission.provider();
            item
        });
        Ok((Box::pin(stream), target))
    }

    /// Validate and feed back a response obtained outside
    /// [`dispatch`](Self::dispatch), such as an assembled stream.
    pub async fn record_success(
        &self,
        request: &ProcessingRequest,
        text: &str,
        provider: &str,
    ) -> Option<Validation> {
        let validation = self.validate(request, text).await;
        match validation {
            Some(v) if !v.is_valid => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                let quality = validation.map_or(self.config.default_quality, |v| v.score);
                self.feed_back(request, text, provider, quality).await;
            }
        }
        validation
    }

    /// Admit queued calls wherever capacity is free.
    pub fn drain_queues(&self) -> usize {
        self.upstream.queues.drain()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            races: self.counters.races.load(Ordering::Relaxed),
            race_failures: self.counters.race_failures.load(Ordering::Relaxed),
            queued_failures: self.counters.queued_failures.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            rejected_by_validator: self.counters.rejected.load(Ordering::Relaxed),
            queue_depths: self.upstream.queues.depths(),
            in_flight: self.upstream.queues.in_flight(),
        }
    }

    async fn resolve(
        &self,
        request: &ProcessingRequest,
    ) -> Result<(String, ModelTarget, SourceTag)> {
        if request.priority == PriorityClass::Ultra {
            let (text, target) = self.race(request).await?;
            Ok((text, target, SourceTag::Parallel))
        } else {
            let (text, target) = self.queued(request).await?;
            Ok((text, target, SourceTag::Upstream))
        }
    }

    async fn race(&self, request: &ProcessingRequest) -> Result<(String, ModelTarget)> {
        let targets = self.race_targets(request)?;
        self.counters.races.fetch_add(1, Ordering::Relaxed);
        debug!(
            targets = ?targets.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "racing providers"
        );

        let (tx, mut rx) = mpsc::channel(targets.len());
        for target in targets {
            let tx = tx.clone();
            let upstream = self.upstream.clone();
            let call = self.completion_request(request, &target.model);
            tokio::spawn(async move {
                let result = upstream.complete(&target, PriorityClass::Ultra, call).await;
                let _ = tx.send((target, result)).await;
            });
        }
        drop(tx);

        let mut attempts = Vec::new();
        let mut timeouts = 0;
        let mut first_timeout = None;
        while let Some((target, result)) = rx.recv().await {
            match result {
                Ok(text) => {
                    metrics::counter!(
                        telemetry::RACES_WON_TOTAL,
                        "provider" => target.provider.clone()
                    )
                    .increment(1);
                    debug!(winner = %target, failed = attempts.len(), "race won");
                    return Ok((text, target));
                }
                Err(e) => {
                    warn!(leg = %target, error = %e, "race leg failed");
                    if let HuginnError::PoolTimeout {
                        provider,
                        model,
                        waited,
                    } = &e
                    {
                        timeouts += 1;
                        first_timeout.get_or_insert_with(|| HuginnError::PoolTimeout {
                            provider: provider.clone(),
                            model: model.clone(),
                            waited: *waited,
                        });
                    }
                    attempts.push(e.into_failure(&target.provider, &target.model));
                }
            }
        }
        self.counters.race_failures.fetch_add(1, Ordering::Relaxed);
        // Every leg waited out its slot: the caller may retry.
        if timeouts == attempts.len() {
            if let Some(timeout) = first_timeout {
                return Err(timeout);
            }
        }
        Err(HuginnError::AllProvidersFailed { attempts })
    }

    async fn queued(&self, request: &ProcessingRequest) -> Result<(String, ModelTarget)> {
        let target = self.primary_target(request)?;
        let result = with_retry(&self.retry, &target.provider, "dispatch", || {
            let call = self.completion_request(request, &target.model);
            self.upstream.complete(&target, request.priority, call)
        })
        .await;
        match result {
            Ok(text) => Ok((text, target)),
            Err(e) => {
                self.counters.queued_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// The pinned target, else the default provider's default model.
    fn primary_target(&self, request: &ProcessingRequest) -> Result<ModelTarget> {
        if let Some(target) = &request.target {
            return Ok(target.clone());
        }
        let pools = &self.upstream.pools;
        let provider = match &self.config.default_provider {
            Some(name) => name.as_str(),
            None => pools
                .provider_names()
                .first()
                .copied()
                .ok_or_else(|| HuginnError::Configuration("no providers registered".into()))?,
        };
        let profile = pools.profile(provider).ok_or_else(|| HuginnError::NotConfigured {
            provider: provider.to_owned(),
            model: String::new(),
        })?;
        Ok(ModelTarget::new(provider, &profile.default_model))
    }

    /// Race targets: the pinned target first, then other providers'
    /// default models fastest-first, capped at the fanout.
    fn race_targets(&self, request: &ProcessingRequest) -> Result<Vec<ModelTarget>> {
        let pools = &self.upstream.pools;
        let pinned = request.target.clone();
        let mut others: Vec<ModelTarget> = pools
            .provider_names()
            .into_iter()
            .filter(|name| pinned.as_ref().is_none_or(|t| t.provider != *name))
            .filter_map(|name| {
                pools
                    .profile(name)
                    .map(|p| ModelTarget::new(name, &p.default_model))
            })
            .collect();
        pools
            .latency()
            .order_fastest(&mut others, |t| t.provider.as_str());

        let mut targets: Vec<ModelTarget> = pinned.into_iter().chain(others).collect();
        targets.truncate(self.config.ultra_race_fanout.max(1));
        if targets.is_empty() {
            return Err(HuginnError::Configuration("no providers registered".into()));
        }
        Ok(targets)
    }

    fn completion_request(&self, request: &ProcessingRequest, model: &str) -> CompletionRequest {
        CompletionRequest {
            messages: request.conversation.clone(),
            model: model.to_owned(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn validate(&self, request: &ProcessingRequest, text: &str) -> Option<Validation> {
        let validator = self.validator.as_ref()?;
        Some(
            validator
                .validate(text, &request.conversation, request.input())
                .await,
        )
    }

    async fn feed_back(
        &self,
        request: &ProcessingRequest,
        text: &str,
        provider: &str,
        quality: f64,
    ) {
        let fingerprint = Fingerprint::of(&request.conversation);
        let cached = CachedResponse::new(text, quality).with_provider(provider);
        self.cache.set(fingerprint.key(), cached, None).await;
        self.cache
            .cache_response_pattern(fingerprint.pattern(), text, quality)
            .await;
        self.predictor
            .learn_in_context(&request.conversation, text, None);
    }
}
