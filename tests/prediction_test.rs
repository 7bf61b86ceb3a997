//! Prediction engine: learning, context recall and persistence.

use huginn::prediction::{PredictionSource, PredictiveModel, Sentiment};
use huginn::{InMemoryStore, Message, PredictionConfig, PredictionEngine};

fn engine() -> PredictionEngine {
    PredictionEngine::with_seed(PredictionConfig::default(), 42)
}

fn weather_model() -> PredictiveModel {
    PredictiveModel::new(
        "weather",
        &["weather", "forecast"],
        &[
            ("Looks sunny today.", Sentiment::Neutral),
            ("Expect rain later.", Sentiment::Neutral),
        ],
    )
}

#[test]
fn probabilities_sum_to_one_after_learning() {
    let engine = engine();
    engine.learn("hello", "Hello! How can I help you today?", Some("Hello! How can I help you today?"));
    engine.learn("hey", "Yo, what's up, long time no see", None);
    engine.learn("hi", "Hi there! What's on your mind?", Some("Hey! Good to see you. What can I do for you?"));

    let model = engine.model("greeting").unwrap();
    assert!((model.candidates.total() - 1.0).abs() < 1e-9);
    assert_eq!(model.usage_count, 3);
}

#[test]
fn good_prediction_raises_its_candidate() {
    let engine = engine();
    let text = "Goodbye! Take care.";
    let before = engine.model("farewell").unwrap();

    let similarity = engine.learn("bye", text, Some(text)).unwrap();
    assert_eq!(similarity, 1.0);

    let after = engine.model("farewell").unwrap();
    let weight = |m: &PredictiveModel| {
        m.candidates
            .iter()
            .find(|c| c.value.text == text)
            .map(|c| c.weight)
            .unwrap()
    };
    assert!(weight(&after) > weight(&before));
    assert!(after.accuracy > before.accuracy);
}

#[test]
fn novel_response_is_adopted_as_candidate() {
    let engine = engine();
    let before = engine.model("gratitude").unwrap().candidates.len();

    engine.learn("thanks", "No problem, glad the deploy went through", None);

    let after = engine.model("gratitude").unwrap();
    assert_eq!(after.candidates.len(), before + 1);
    assert!(after
        .candidates
        .iter()
        .any(|c| c.value.text == "No problem, glad the deploy went through"));
}

#[test]
fn accurate_category_crosses_the_confidence_floor() {
    let engine = engine();
    engine.add_model(weather_model());
    assert!(engine.predict("weather forecast please", None).is_none());

    for _ in 0..10 {
        engine.learn("weather forecast please", "Looks sunny today.", Some("Looks sunny today."));
    }

    let prediction = engine.predict("weather forecast please", None).unwrap();
    assert_eq!(prediction.source, PredictionSource::Category("weather".into()));
    assert!(prediction.confidence >= 0.75);
}

#[test]
fn consistent_context_is_recalled_once_trusted() {
    let engine = engine();
    let input = "tell me the capital of france";
    let conversation = [Message::user(input)];

    for _ in 0..3 {
        assert!(engine.predict(input, Some(&[])).is_none());
        engine.learn_in_context(&conversation, "Paris.", None);
    }

    let pattern = engine.context_pattern(&conversation).unwrap();
    assert_eq!(pattern.observations, 3);
    assert!(pattern.confidence > 0.75);

    let prediction = engine.predict(input, None).unwrap();
    assert_eq!(prediction.text, "Paris.");
}

#[test]
fn context_recall_stays_with_its_own_window() {
    let engine = engine();
    let input = "xyzzy";
    let window = [
        Message::user("zorp"),
        Message::assistant("blip"),
        Message::user(input),
    ];
    for _ in 0..4 {
        engine.learn_in_context(&window, "Context A answer", None);
    }

    let recalled = engine.predict(input, Some(&window[..2])).unwrap();
    assert_eq!(recalled.source, PredictionSource::Context);
    assert_eq!(recalled.text, "Context A answer");

    let elsewhere = [Message::user("totally"), Message::assistant("different")];
    assert!(engine.predict(input, Some(&elsewhere)).is_none());

    let again = engine.predict(input, Some(&window[..2])).unwrap();
    assert_eq!(again.source, PredictionSource::Context);
}

#[test]
fn context_trust_resets_when_the_answer_changes() {
    let engine = engine();
    let conversation = [Message::user("tell me the capital of france")];
    for _ in 0..4 {
        engine.learn_in_context(&conversation, "Paris.", None);
    }
    engine.learn_in_context(&conversation, "Completely different reply here.", None);

    let pattern = engine.context_pattern(&conversation).unwrap();
    assert_eq!(pattern.response, "Completely different reply here.");
    assert_eq!(pattern.observations, 1);
    assert!(engine.predict("tell me the capital of france", None).is_none());
}

#[tokio::test]
async fn learned_state_survives_persist_and_restore() {
    let store = InMemoryStore::new();
    let before = engine();
    before.learn("thanks", "Happy to help!", Some("Happy to help!"));
    before.learn_in_context(&[Message::user("ping")], "pong", None);

    let written = before.persist(&store).await;
    let models = before.stats().models;
    assert_eq!(written, models + 1);

    let after = engine();
    assert_eq!(after.restore(&store).await, written);

    let (a, b) = (
        before.model("gratitude").unwrap(),
        after.model("gratitude").unwrap(),
    );
    assert_eq!(a.candidates.len(), b.candidates.len());
    for (x, y) in a.candidates.iter().zip(b.candidates.iter()) {
        assert_eq!(x.value, y.value);
        assert!((x.weight - y.weight).abs() < 1e-12);
    }
    assert!((a.accuracy - b.accuracy).abs() < 1e-12);
    assert_eq!(
        after.context_pattern(&[Message::user("ping")]).unwrap().response,
        "pong"
    );
}

#[tokio::test]
async fn persist_against_offline_store_keeps_memory_state() {
    let store = InMemoryStore::new();
    store.set_available(false);
    let engine = engine();
    engine.learn("bye", "See you later!", None);

    assert_eq!(engine.persist(&store).await, 0);
    assert_eq!(engine.restore(&store).await, 0);
    assert_eq!(engine.model("farewell").unwrap().usage_count, 1);
}
