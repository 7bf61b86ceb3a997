//! Parallel dispatcher: races, priority queues, retries and feedback.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use huginn::providers::{Completion, CompletionRequest};
use huginn::{
    CacheConfig, DispatcherConfig, Fingerprint, HuginnError, InMemoryStore, Message, ModelTarget,
    ParallelDispatcher, PoolManager, PredictionConfig, PredictionEngine, PriorityClass,
    ProcessingRequest, ProviderProfile, ResponseValidator, Result, RetryConfig, SourceTag,
    TieredCache, UpstreamConnection, UpstreamProvider, Validation,
};

use common::{Script, ScriptedProvider};

// ============================================================================
// Mock providers
// ============================================================================

/// Records the user input of every call in arrival order.
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    failures: Arc<AtomicU32>,
}

impl Recorder {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::default(),
            delay,
            failures: Arc::new(AtomicU32::new(0)),
        })
    }

    fn failing_first(delay: Duration, failures: u32) -> Arc<Self> {
        let recorder = Self::new(delay);
        recorder.failures.store(failures, Ordering::SeqCst);
        recorder
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamProvider for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn connect(&self, _model: &str) -> Result<Arc<dyn UpstreamConnection>> {
        Ok(Arc::new(RecorderConnection {
            log: Arc::clone(&self.log),
            delay: self.delay,
            failures: Arc::clone(&self.failures),
        }))
    }
}

struct RecorderConnection {
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl UpstreamConnection for RecorderConnection {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let input = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.log.lock().unwrap().push(input.clone());
        tokio::time::sleep(self.delay).await;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(HuginnError::UpstreamFailure {
                provider: "recorder".into(),
                model: request.model.clone(),
                message: "overloaded".into(),
                status: Some(503),
                retry_after: None,
            });
        }
        Ok(Completion::new(format!("re: {input}"), &request.model))
    }
}

/// Rejects responses containing a banned word.
struct Banned(&'static str);

#[async_trait]
impl ResponseValidator for Banned {
    async fn validate(&self, response: &str, _history: &[Message], _user: &str) -> Validation {
        let is_valid = !response.contains(self.0);
        Validation {
            is_valid,
            should_retry: false,
            score: if is_valid { 0.95 } else { 0.1 },
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Rig {
    dispatcher: ParallelDispatcher,
    cache: Arc<TieredCache>,
}

type Entry = (Arc<dyn UpstreamProvider>, ProviderProfile);

fn entry<P: UpstreamProvider + 'static>(provider: &Arc<P>, profile: ProviderProfile) -> Entry {
    (provider.clone(), profile)
}

fn rig(providers: Vec<Entry>, config: DispatcherConfig) -> Rig {
    let mut pools = PoolManager::new();
    for (provider, profile) in providers {
        pools.register(provider, profile).unwrap();
    }
    let cache = Arc::new(TieredCache::new(
        CacheConfig::default(),
        Arc::new(InMemoryStore::new()),
    ));
    let predictor = Arc::new(PredictionEngine::with_seed(PredictionConfig::default(), 7));
    let dispatcher =
        ParallelDispatcher::new(config, Arc::new(pools), Arc::clone(&cache), predictor)
            .with_retry(RetryConfig::new().jitter(false));
    Rig { dispatcher, cache }
}

fn request(input: &str, priority: PriorityClass) -> ProcessingRequest {
    ProcessingRequest::new(vec![Message::user(input)], priority)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn queued_calls_run_in_priority_order() {
    let recorder = Recorder::new(Duration::from_millis(100));
    let rig = Arc::new(rig(
        vec![entry(&recorder, ProviderProfile::new("m").max_connections(1))],
        DispatcherConfig::default(),
    ));

    let mut tasks = Vec::new();
    for (input, priority) in [
        ("blocker", PriorityClass::Normal),
        ("low", PriorityClass::Low),
        ("ultra", PriorityClass::Ultra),
        ("normal", PriorityClass::Normal),
    ] {
        let rig = Arc::clone(&rig);
        tasks.push(tokio::spawn(async move {
            rig.dispatcher.dispatch(&request(input, priority)).await
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let depths = rig.dispatcher.stats().queue_depths;
    assert_eq!(depths.get("recorder"), Some(&3));

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(recorder.log(), ["blocker", "ultra", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn race_returns_first_success_and_caches_it() {
    let a = ScriptedProvider::new("a", Script::Fail(500, Duration::from_millis(10)));
    let b = ScriptedProvider::new("b", Script::Reply("from b", Duration::from_millis(50)));
    let c = ScriptedProvider::new("c", Script::Fail(502, Duration::from_millis(20)));
    let rig = rig(
        vec![
            entry(&a, ProviderProfile::new("m")),
            entry(&b, ProviderProfile::new("m")),
            entry(&c, ProviderProfile::new("m")),
        ],
        DispatcherConfig::default(),
    );

    let req = request("what is the airspeed of a swallow", PriorityClass::Ultra);
    let response = rig.dispatcher.dispatch(&req).await.unwrap();

    assert_eq!(response.source, SourceTag::Parallel);
    assert_eq!(response.text, "from b");
    assert_eq!(response.provider.as_deref(), Some("b"));
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));

    let cached = rig
        .cache
        .get(Fingerprint::of(&req.conversation).key())
        .await
        .unwrap();
    assert_eq!(cached.text, "from b");
    assert_eq!(cached.provider.as_deref(), Some("b"));

    let stats = rig.dispatcher.stats();
    assert_eq!((stats.races, stats.race_failures), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn race_with_every_leg_failing_aggregates_failures() {
    let a = ScriptedProvider::new("a", Script::Fail(500, Duration::from_millis(10)));
    let b = ScriptedProvider::new("b", Script::Fail(401, Duration::from_millis(10)));
    let rig = rig(
        vec![
            entry(&a, ProviderProfile::new("m")),
            entry(&b, ProviderProfile::new("m")),
        ],
        DispatcherConfig::default(),
    );

    let err = rig
        .dispatcher
        .dispatch(&request("anything", PriorityClass::Ultra))
        .await
        .unwrap_err();
    match &err {
        HuginnError::AllProvidersFailed { attempts } => {
            let mut providers: Vec<_> = attempts.iter().map(|a| a.provider.as_str()).collect();
            providers.sort_unstable();
            assert_eq!(providers, ["a", "b"]);
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }
    assert!(err.is_fatal());
    assert_eq!(rig.dispatcher.stats().race_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn race_fanout_caps_legs() {
    let a = ScriptedProvider::replying("a", "a");
    let b = ScriptedProvider::replying("b", "b");
    let c = ScriptedProvider::replying("c", "c");
    let rig = rig(
        vec![
            entry(&a, ProviderProfile::new("m")),
            entry(&b, ProviderProfile::new("m")),
            entry(&c, ProviderProfile::new("m")),
        ],
        DispatcherConfig::default().ultra_race_fanout(2),
    );

    rig.dispatcher
        .dispatch(&request("hmm", PriorityClass::Ultra))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(a.calls() + b.calls() + c.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_dispatch_retries_transient_failures() {
    let recorder = Recorder::failing_first(Duration::ZERO, 2);
    let rig = rig(
        vec![entry(&recorder, ProviderProfile::new("m"))],
        DispatcherConfig::default(),
    );

    let response = rig
        .dispatcher
        .dispatch(&request("try again", PriorityClass::High))
        .await
        .unwrap();
    assert_eq!(response.source, SourceTag::Upstream);
    assert_eq!(response.text, "re: try again");
    assert_eq!(recorder.log().len(), 3);
}

#[tokio::test]
async fn unknown_pinned_target_is_not_configured() {
    let rig = rig(
        vec![entry(&ScriptedProvider::replying("a", "ok"), ProviderProfile::new("m"))],
        DispatcherConfig::default(),
    );
    let req = request("hi", PriorityClass::Normal).with_target(ModelTarget::new("nobody", "m"));
    let err = rig.dispatcher.dispatch(&req).await.unwrap_err();
    assert!(matches!(err, HuginnError::NotConfigured { .. }));
}

#[tokio::test]
async fn rejected_response_is_returned_but_not_cached() {
    let provider = ScriptedProvider::replying("a", "as an ai language model");
    let mut pools = PoolManager::new();
    pools.register(provider, ProviderProfile::new("m")).unwrap();
    let cache = Arc::new(TieredCache::new(
        CacheConfig::default(),
        Arc::new(InMemoryStore::new()),
    ));
    let predictor = Arc::new(PredictionEngine::with_seed(PredictionConfig::default(), 1));
    let dispatcher = ParallelDispatcher::new(
        DispatcherConfig::default(),
        Arc::new(pools),
        Arc::clone(&cache),
        predictor,
    )
    .with_validator(Arc::new(Banned("ai language model")));

    let req = request("who are you", PriorityClass::Normal);
    let response = dispatcher.dispatch(&req).await.unwrap();
    let validation = response.validation.unwrap();
    assert!(!validation.is_valid);
    assert_eq!(response.confidence, 0.1);
    assert!(cache.get(Fingerprint::of(&req.conversation).key()).await.is_none());
    assert_eq!(dispatcher.stats().rejected_by_validator, 1);
}

#[tokio::test(start_paused = true)]
async fn batch_resolves_every_request_in_order() {
    let recorder = Recorder::new(Duration::from_millis(20));
    let rig = rig(
        vec![entry(&recorder, ProviderProfile::new("m").max_connections(2))],
        DispatcherConfig::default(),
    );

    let requests: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|input| request(input, PriorityClass::Normal))
        .collect();
    let results = rig.dispatcher.dispatch_batch(&requests).await;

    let texts: Vec<_> = results.into_iter().map(|r| r.unwrap().text).collect();
    assert_eq!(texts, ["re: one", "re: two", "re: three"]);
    assert_eq!(rig.dispatcher.stats().batches, 1);
}
