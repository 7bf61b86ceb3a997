//! End-to-end cascade behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use huginn::{
    CacheConfig, CollectingSink, DispatcherConfig, HuginnError, InMemoryStore, Message,
    Orchestrator, OutputKind, OutputUnit, PersistentStore, PriorityClass, ProviderProfile,
    SourceTag, StreamConfig,
};

use common::{Script, ScriptedProvider};

fn orchestrator(provider: Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::builder()
        .provider(provider, ProviderProfile::new("m").max_connections(1))
        .prediction_seed(11)
        .build()
        .unwrap()
}

#[tokio::test]
async fn greeting_is_answered_by_template() {
    let provider = ScriptedProvider::replying("up", "should not be called");
    let orchestrator = orchestrator(provider.clone());

    let response = orchestrator
        .handle_turn(&[Message::user("hello")], PriorityClass::Normal)
        .await
        .unwrap();

    assert_eq!(response.source, SourceTag::Template);
    assert!(response.confidence >= 0.9);
    assert!(response.provider.is_none());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn repeated_fingerprint_is_served_from_cache() {
    let provider = ScriptedProvider::replying("up", "Lifetimes tie borrows to scopes.");
    let orchestrator = orchestrator(provider.clone());
    let conversation = [Message::user("explain rust lifetimes to me in depth please")];

    let first = orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    assert_eq!(first.source, SourceTag::Upstream);

    let second = orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    assert_eq!(second.source, SourceTag::Cache);
    assert_eq!(second.text, first.text);
    assert_eq!(second.provider.as_deref(), Some("up"));
    assert_eq!(provider.calls(), 1);

    let stats = orchestrator.stats();
    assert_eq!(stats.turns.total, 2);
    assert_eq!(stats.turns.by_source["cache"], 1);
    assert_eq!(stats.turns.by_source["upstream"], 1);
    assert!((stats.turns.fast_path_rate - 0.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_entry_falls_through_to_dispatch() {
    let provider = ScriptedProvider::replying("up", "fresh answer");
    let orchestrator = Orchestrator::builder()
        .provider(provider.clone(), ProviderProfile::new("m"))
        .cache(CacheConfig::new().default_ttl(Duration::from_secs(60)))
        .dispatcher(DispatcherConfig {
            default_quality: 0.8,
            ..DispatcherConfig::default()
        })
        .build()
        .unwrap();
    let conversation = [Message::user("summarize the meeting notes from tuesday")];

    orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    let again = orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    assert_eq!(again.source, SourceTag::Upstream);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn high_quality_answer_outlives_its_cache_entry_as_pregenerated() {
    let provider = ScriptedProvider::replying("up", "Here is the summary.");
    let orchestrator = Orchestrator::builder()
        .provider(provider.clone(), ProviderProfile::new("m"))
        .cache(CacheConfig::new().default_ttl(Duration::from_secs(60)))
        .build()
        .unwrap();
    let conversation = [Message::user("summarize the meeting notes from tuesday")];

    orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    let again = orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    assert_eq!(again.source, SourceTag::PreGenerated);
    assert_eq!(again.text, "Here is the summary.");
    assert_eq!(provider.calls(), 1);
    assert_eq!(orchestrator.stats().cache.pattern_count, 1);
}

#[tokio::test(start_paused = true)]
async fn ultra_turns_share_a_single_connection() {
    let provider = ScriptedProvider::new("up", Script::Reply("done", Duration::from_millis(100)));
    let orchestrator = Arc::new(orchestrator(provider.clone()));

    let turn = |text: &'static str| {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .handle_turn(&[Message::user(text)], PriorityClass::Ultra)
                .await
        })
    };
    let first = turn("compare tokio and async-std schedulers");
    let second = turn("describe the actor model with examples");

    for task in [first, second] {
        match task.await.unwrap() {
            Ok(response) => assert_eq!(response.source, SourceTag::Parallel),
            Err(e) => assert!(matches!(e, HuginnError::PoolTimeout { .. })),
        }
    }
    assert_eq!(provider.connects(), 1);
    let pools = orchestrator.stats().pools;
    assert_eq!(pools[0].size, 1);
}

#[tokio::test(start_paused = true)]
async fn saturated_ultra_turn_times_out_at_the_acquire_deadline() {
    let provider = ScriptedProvider::new("up", Script::Reply("slow", Duration::from_secs(2)));
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .provider(
                provider.clone(),
                ProviderProfile::new("m")
                    .max_connections(1)
                    .acquire_timeout(Duration::from_millis(50)),
            )
            .build()
            .unwrap(),
    );

    let turn = |text: &'static str| {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let result = orchestrator
                .handle_turn(&[Message::user(text)], PriorityClass::Ultra)
                .await;
            (result, started.elapsed())
        })
    };
    let first = turn("compare tokio and async-std schedulers");
    let second = turn("describe the actor model with examples");

    let mut answered = 0;
    let mut timed_out = 0;
    for task in [first, second] {
        match task.await.unwrap() {
            (Ok(response), elapsed) => {
                assert_eq!(response.source, SourceTag::Parallel);
                assert!(elapsed >= Duration::from_secs(2));
                answered += 1;
            }
            (Err(e), elapsed) => {
                assert!(e.is_transient());
                match e {
                    HuginnError::PoolTimeout { provider, waited, .. } => {
                        assert_eq!(provider, "up");
                        assert_eq!(waited, Duration::from_millis(50));
                    }
                    other => panic!("expected PoolTimeout, got {other:?}"),
                }
                assert!(elapsed < Duration::from_millis(500));
                timed_out += 1;
            }
        }
    }
    assert_eq!((answered, timed_out), (1, 1));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn race_survives_failing_providers() {
    let a = ScriptedProvider::new("a", Script::Fail(500, Duration::from_millis(5)));
    let b = ScriptedProvider::new("b", Script::Reply("b wins", Duration::from_millis(30)));
    let c = ScriptedProvider::new("c", Script::Fail(503, Duration::from_millis(5)));
    let orchestrator = Orchestrator::builder()
        .provider(a, ProviderProfile::new("m"))
        .provider(b, ProviderProfile::new("m"))
        .provider(c, ProviderProfile::new("m"))
        .build()
        .unwrap();
    let conversation = [Message::user("what should I name my new crate")];

    let response = orchestrator
        .handle_turn(&conversation, PriorityClass::Ultra)
        .await
        .unwrap();
    assert_eq!(response.source, SourceTag::Parallel);
    assert_eq!(response.text, "b wins");

    let cached = orchestrator
        .handle_turn(&conversation, PriorityClass::Normal)
        .await
        .unwrap();
    assert_eq!(cached.source, SourceTag::Cache);
    assert_eq!(cached.text, "b wins");
}

#[tokio::test]
async fn connection_rotation_is_visible_in_stats() {
    let provider = ScriptedProvider::replying("up", "ok");
    let orchestrator = Orchestrator::builder()
        .provider(
            provider.clone(),
            ProviderProfile::new("m")
                .max_connections(1)
                .max_requests_per_connection(2),
        )
        .build()
        .unwrap();

    for i in 0..5 {
        let text = format!("question number {i} about the build system");
        orchestrator
            .handle_turn(&[Message::user(text)], PriorityClass::Normal)
            .await
            .unwrap();
    }
    assert_eq!(provider.connects(), 3);
    let by_provider = orchestrator.stats().pools_by_provider();
    assert_eq!(by_provider["up"].retired, 2);
    assert_eq!(by_provider["up"].served, 5);
}

#[tokio::test]
async fn dispatch_failure_is_the_only_fatal_error() {
    let provider = ScriptedProvider::new("up", Script::Fail(400, Duration::ZERO));
    let orchestrator = orchestrator(provider);

    let greeting = orchestrator
        .handle_turn(&[Message::user("thanks")], PriorityClass::Normal)
        .await;
    assert!(greeting.is_ok());

    let err = orchestrator
        .handle_turn(
            &[Message::user("write a haiku about borrow checking")],
            PriorityClass::Normal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::UpstreamFailure { status: Some(400), .. }));
    assert_eq!(orchestrator.stats().turns.failures, 1);
}

#[tokio::test]
async fn empty_conversation_is_invalid() {
    let orchestrator = orchestrator(ScriptedProvider::replying("up", "ok"));
    let err = orchestrator
        .handle_turn(&[Message::system("be brief")], PriorityClass::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::InvalidInput(_)));
}

#[tokio::test]
async fn store_outage_degrades_to_dispatch() {
    let store = Arc::new(InMemoryStore::new());
    store.set_available(false);
    let provider = ScriptedProvider::replying("up", "still works");
    let orchestrator = Orchestrator::builder()
        .provider(provider.clone(), ProviderProfile::new("m"))
        .store(store)
        .build()
        .unwrap();

    let response = orchestrator
        .handle_turn(
            &[Message::user("how do I profile an async program")],
            PriorityClass::High,
        )
        .await
        .unwrap();
    assert_eq!(response.text, "still works");
    assert!(orchestrator.stats().cache.store_errors > 0);
}

#[tokio::test(start_paused = true)]
async fn streamed_turn_emits_chunks_then_complete() {
    let provider = ScriptedProvider::new(
        "up",
        Script::Fragments(
            vec!["Rust ", "has ", "zero-cost ", "abstractions ", "and ", "fearless ", "concurrency."],
            Duration::from_millis(5),
        ),
    );
    let orchestrator = Orchestrator::builder()
        .provider(provider, ProviderProfile::new("m"))
        .stream(StreamConfig::new().batch_size(3).adaptive(false))
        .build()
        .unwrap();
    let sink = CollectingSink::new();

    let response = orchestrator
        .stream_turn(
            &[Message::user("why do people like rust so much")],
            PriorityClass::Normal,
            &sink,
        )
        .await
        .unwrap();

    let units = sink.units();
    let (last, chunks) = units.split_last().unwrap();
    assert!(chunks.len() >= 2);
    assert!(chunks.iter().all(|u| u.kind == OutputKind::Chunk));
    assert_eq!(last, &OutputUnit::complete(&response.text));
    assert_eq!(
        response.text,
        "Rust has zero-cost abstractions and fearless concurrency."
    );
    let joined: String = chunks.iter().map(|u| u.payload.as_str()).collect();
    assert_eq!(joined.trim(), response.text);
}

#[tokio::test]
async fn streamed_fast_path_sends_one_complete_unit() {
    let orchestrator = orchestrator(ScriptedProvider::replying("up", "unused"));
    let sink = CollectingSink::new();

    let response = orchestrator
        .stream_turn(&[Message::user("hello")], PriorityClass::Normal, &sink)
        .await
        .unwrap();
    assert_eq!(response.source, SourceTag::Template);
    assert_eq!(sink.units(), [OutputUnit::complete(response.text)]);
}

#[tokio::test]
async fn streamed_failure_ends_with_error_unit() {
    let orchestrator = Orchestrator::builder()
        .provider(
            ScriptedProvider::new("up", Script::Fail(401, Duration::ZERO)),
            ProviderProfile::new("m"),
        )
        .dispatcher(DispatcherConfig::new().default_provider("up"))
        .build()
        .unwrap();
    let sink = CollectingSink::new();

    let result = orchestrator
        .stream_turn(
            &[Message::user("list the planets in order")],
            PriorityClass::Normal,
            &sink,
        )
        .await;
    assert!(result.is_err());
    let units = sink.units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].kind, OutputKind::Error);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_persists_learning_and_drains_pools() {
    let store = Arc::new(InMemoryStore::new());
    let provider = ScriptedProvider::replying("up", "Happy to help with that!");
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .provider(provider, ProviderProfile::new("m").keep_alive(1))
            .store(store.clone())
            .maintenance_interval(Duration::from_secs(1))
            .build()
            .unwrap(),
    );

    orchestrator.start().await;
    orchestrator.start().await;
    assert!(orchestrator.background_running());
    assert_eq!(orchestrator.stats().pools[0].idle, 1);

    orchestrator
        .handle_turn(
            &[Message::user("can you help me plan a trip")],
            PriorityClass::Normal,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(orchestrator.shutdown(Duration::from_secs(1)).await);
    assert!(!orchestrator.background_running());
    assert!(!store.scan_prefix("predict:").await.unwrap().is_empty());
}
