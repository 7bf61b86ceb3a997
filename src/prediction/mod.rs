//! Self-adjusting response prediction.
//!
//! [`PredictionEngine::predict`] tries three sources in order:
//!
//! 1. a direct cache of recent category predictions, keyed by normalized
//!    input;
//! 2. keyword categories ([`model::default_models`]), sampling a candidate by
//!    cumulative probability;
//! 3. context patterns: the response last seen after the same short
//!    conversation window, trusted only above
//!    [`PredictionConfig::context_trust`].
//!
//! A prediction is returned only when its confidence reaches
//! [`PredictionConfig::min_confidence`]. Every dispatched turn is fed back
//! through [`PredictionEngine::learn_in_context`], which nudges candidate
//! probabilities, model accuracy and context trust.

pub mod context;
pub mod model;
pub mod sampling;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

pub use context::ContextPattern;
pub use model::{CandidateResponse, PredictiveModel, Sentiment, default_models, similarity};
pub use sampling::{Weighted, WeightedDistribution};

use crate::cache::PersistentStore;
use crate::cache::response::unix_millis;
use crate::config::de_secs;
use crate::config::de_secs_opt;
use crate::fingerprint::{Fingerprint, content_key};
use crate::telemetry;
use crate::types::{Message, last_user_message};
use model::{LearnParams, tokens};

const MODEL_PREFIX: &str = "predict:model:";
const CONTEXT_PREFIX: &str = "predict:ctx:";

/// Configuration for the prediction engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Probability step applied per learning event. Default: 0.05.
    pub learning_rate: f64,
    /// EMA factor for model accuracy. Default: 0.1.
    pub accuracy_smoothing: f64,
    /// Similarity at or above which a prediction counts as good. Default: 0.5.
    pub good_similarity: f64,
    /// Predictions below this confidence are withheld. Default: 0.75.
    pub min_confidence: f64,
    /// Context patterns are used only above this confidence. Default: 0.7.
    pub context_trust: f64,
    /// Confidence of a newly seen context pattern. Default: 0.5.
    pub context_initial_confidence: f64,
    /// Share of the remaining gap to 1 closed per consistent observation. Default: 0.3.
    pub context_reinforcement: f64,
    /// Context patterns kept in memory. Default: 5,000.
    pub context_capacity: usize,
    /// Candidates a category may accumulate from observed responses. Default: 8.
    pub max_candidates_per_model: usize,
    /// Lifetime of the direct prediction cache. Default: 5 minutes.
    #[serde(rename = "prediction_ttl_secs", deserialize_with = "de_secs")]
    pub prediction_ttl: Duration,
    /// Direct prediction cache size. Default: 10,000.
    pub prediction_capacity: u64,
    /// How often learned state is written to the persistent store. Default: 5 minutes.
    #[serde(rename = "persist_interval_secs", deserialize_with = "de_secs_opt")]
    pub persist_interval: Option<Duration>,
    /// TTL of persisted learning state. Default: 7 days.
    #[serde(rename = "persist_ttl_secs", deserialize_with = "de_secs")]
    pub persist_ttl: Duration,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            accuracy_smoothing: 0.1,
            good_similarity: 0.5,
            min_confidence: 0.75,
            context_trust: 0.7,
            context_initial_confidence: 0.5,
            context_reinforcement: 0.3,
            context_capacity: 5_000,
            max_candidates_per_model: 8,
            prediction_ttl: Duration::from_secs(300),
            prediction_capacity: 10_000,
            persist_interval: Some(Duration::from_secs(300)),
            persist_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl PredictionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_confidence(mut self, floor: f64) -> Self {
        self.min_confidence = floor;
        self
    }

    pub fn learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn persist_interval(mut self, interval: Option<Duration>) -> Self {
        self.persist_interval = interval;
        self
    }

    fn learn_params(&self) -> LearnParams {
        LearnParams {
            learning_rate: self.learning_rate,
            accuracy_smoothing: self.accuracy_smoothing,
            good_similarity: self.good_similarity,
            novel_similarity: 0.2,
            max_candidates: self.max_candidates_per_model,
        }
    }
}

/// Where a prediction came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionSource {
    /// Served from the direct prediction cache.
    Cached,
    /// Sampled from the named category.
    Category(String),
    /// Recalled from a previously seen conversation window.
    Context,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub text: String,
    pub confidence: f64,
    pub source: PredictionSource,
}

/// Counters exposed through [`PredictionEngine::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictionStats {
    pub models: usize,
    pub context_patterns: usize,
    pub predictions: u64,
    pub withheld: u64,
    pub learn_events: u64,
    pub mean_accuracy: f64,
}

#[derive(Default)]
struct Counters {
    predictions: AtomicU64,
    withheld: AtomicU64,
    learn_events: AtomicU64,
}

/// Category and context prediction with online learning.
pub struct PredictionEngine {
    config: PredictionConfig,
    models: Mutex<Vec<PredictiveModel>>,
    contexts: Mutex<HashMap<String, ContextPattern>>,
    recent: moka::sync::Cache<String, Prediction>,
    rng: Mutex<StdRng>,
    counters: Counters,
}

impl PredictionEngine {
    /// Engine with the built-in categories.
    pub fn new(config: PredictionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Engine with a deterministic sampler.
    pub fn with_seed(config: PredictionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: PredictionConfig, rng: StdRng) -> Self {
        let recent = moka::sync::Cache::builder()
            .max_capacity(config.prediction_capacity)
            .time_to_live(config.prediction_ttl)
            .build();
        Self {
            config,
            models: Mutex::new(default_models()),
            contexts: Mutex::new(HashMap::new()),
            recent,
            rng: Mutex::new(rng),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Add a category, replacing any model with the same id.
    pub fn add_model(&self, model: PredictiveModel) {
        let mut models = self.lock_models();
        match models.iter_mut().find(|m| m.id == model.id) {
            Some(existing) => *existing = model,
            None => models.push(model),
        }
    }

    /// Snapshot of one category.
    pub fn model(&self, id: &str) -> Option<PredictiveModel> {
        self.lock_models().iter().find(|m| m.id == id).cloned()
    }

    /// Snapshot of the context pattern for a conversation window.
    pub fn context_pattern(&self, conversation: &[Message]) -> Option<ContextPattern> {
        let fingerprint = Fingerprint::of(conversation);
        self.lock_contexts().get(fingerprint.key()).cloned()
    }

    /// Predict the response to `input`.
    ///
    /// `prior` is the conversation before `input`; it enables the
    /// context-pattern fallback.
    #[instrument(skip_all, fields(operation = "predict"))]
    pub fn predict(&self, input: &str, prior: Option<&[Message]>) -> Option<Prediction> {
        let normalized = normalize(input);
        if normalized.is_empty() {
            return None;
        }
        let cache_key = content_key(&normalized);

        if let Some(mut hit) = self.recent.get(&cache_key) {
            hit.source = PredictionSource::Cached;
            self.counters.predictions.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        let prediction = self
            .predict_from_category(&normalized)
            .filter(|p| p.confidence >= self.config.min_confidence)
            .or_else(|| self.predict_from_context(input, prior));

        match prediction {
            Some(prediction) => {
                debug!(confidence = prediction.confidence, source = ?prediction.source, "prediction");
                self.counters.predictions.fetch_add(1, Ordering::Relaxed);
                // Context recalls depend on the window, not the input alone.
                if matches!(prediction.source, PredictionSource::Category(_)) {
                    self.recent.insert(cache_key, prediction.clone());
                }
                Some(prediction)
            }
            None => {
                self.counters.withheld.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Learn from one observed response to `input`.
    ///
    /// Returns the similarity between prediction and reality, or `None` when
    /// no category matched the input.
    #[instrument(skip_all, fields(operation = "learn"))]
    pub fn learn(&self, input: &str, actual: &str, predicted: Option<&str>) -> Option<f64> {
        let normalized = normalize(input);
        self.recent.invalidate(&content_key(&normalized));

        let params = self.config.learn_params();
        let outcome = {
            let mut models = self.lock_models();
            let index = best_match(&models, &normalized)?;
            let model = &mut models[index];
            let similarity = model.learn(predicted, actual, params);
            (model.id.clone(), similarity, model.accuracy)
        };

        let (model_id, similarity, accuracy) = outcome;
        debug!(model = %model_id, similarity, accuracy, "learned");
        self.counters.learn_events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::LEARN_EVENTS_TOTAL).increment(1);
        Some(similarity)
    }

    /// Learn from a full conversation ending in the user turn that `actual`
    /// answered: updates the matching category and the context pattern.
    pub fn learn_in_context(
        &self,
        conversation: &[Message],
        actual: &str,
        predicted: Option<&str>,
    ) -> Option<f64> {
        let similarity = last_user_message(conversation)
            .and_then(|input| self.learn(input, actual, predicted));
        self.record_context(conversation, actual);
        similarity
    }

    /// Save models and context patterns to the store.
    ///
    /// Store failures are logged and skipped. Returns the number of records
    /// written.
    #[instrument(skip_all, fields(operation = "prediction_persist"))]
    pub async fn persist(&self, store: &dyn PersistentStore) -> usize {
        let models = self.lock_models().clone();
        let contexts: Vec<(String, ContextPattern)> = self
            .lock_contexts()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut records = Vec::with_capacity(models.len() + contexts.len());
        for model in &models {
            match serde_json::to_vec(model) {
                Ok(bytes) => records.push((format!("{MODEL_PREFIX}{}", model.id), bytes)),
                Err(e) => warn!(model = %model.id, error = %e, "failed to encode model"),
            }
        }
        for (key, pattern) in &contexts {
            match serde_json::to_vec(pattern) {
                Ok(bytes) => records.push((format!("{CONTEXT_PREFIX}{key}"), bytes)),
                Err(e) => warn!(error = %e, "failed to encode context pattern"),
            }
        }

        let mut written = 0;
        for (key, bytes) in records {
            match store.set_with_ttl(&key, bytes, self.config.persist_ttl).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(error = %e, "persisting learned state failed; keeping in memory");
                    metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "operation" => "persist")
                        .increment(1);
                    break;
                }
            }
        }
        debug!(written, "persisted learned state");
        written
    }

    /// Load models and context patterns saved by [`persist`](Self::persist).
    ///
    /// Returns the number of records restored; store failures yield 0.
    #[instrument(skip_all, fields(operation = "prediction_restore"))]
    pub async fn restore(&self, store: &dyn PersistentStore) -> usize {
        let mut restored = 0;

        for model in load_prefix::<PredictiveModel>(store, MODEL_PREFIX).await {
            if model.candidates.is_empty() {
                continue;
            }
            self.add_model(model);
            restored += 1;
        }

        let contexts = load_prefix_keyed::<ContextPattern>(store, CONTEXT_PREFIX).await;
        {
            let mut map = self.lock_contexts();
            for (key, pattern) in contexts {
                map.insert(key, pattern);
                restored += 1;
            }
        }
        self.enforce_context_capacity();

        debug!(restored, "restored learned state");
        restored
    }

    pub fn stats(&self) -> PredictionStats {
        let (models, mean_accuracy) = {
            let models = self.lock_models();
            let mean = if models.is_empty() {
                0.0
            } else {
                models.iter().map(|m| m.accuracy).sum::<f64>() / models.len() as f64
            };
            (models.len(), mean)
        };
        PredictionStats {
            models,
            context_patterns: self.lock_contexts().len(),
            predictions: self.counters.predictions.load(Ordering::Relaxed),
            withheld: self.counters.withheld.load(Ordering::Relaxed),
            learn_events: self.counters.learn_events.load(Ordering::Relaxed),
            mean_accuracy,
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn predict_from_category(&self, normalized: &str) -> Option<Prediction> {
        let u = {
            use rand::Rng;
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .r#gen::<f64>()
        };
        let models = self.lock_models();
        let model = &models[best_match(&models, normalized)?];
        let (index, candidate) = model.candidates.sample_with(u)?;
        let probability = model.candidates.get(index)?.weight;
        Some(Prediction {
            text: candidate.text.clone(),
            confidence: model.confidence_for(probability),
            source: PredictionSource::Category(model.id.clone()),
        })
    }

    fn predict_from_context(&self, input: &str, prior: Option<&[Message]>) -> Option<Prediction> {
        let mut window: Vec<Message> = prior.map(<[Message]>::to_vec).unwrap_or_default();
        window.push(Message::user(input));
        let fingerprint = Fingerprint::of(&window);

        let contexts = self.lock_contexts();
        let pattern = contexts.get(fingerprint.key())?;
        if pattern.confidence <= self.config.context_trust
            || pattern.confidence < self.config.min_confidence
        {
            return None;
        }
        Some(Prediction {
            text: pattern.response.clone(),
            confidence: pattern.confidence,
            source: PredictionSource::Context,
        })
    }

    fn record_context(&self, conversation: &[Message], actual: &str) {
        if conversation.is_empty() || actual.trim().is_empty() {
            return;
        }
        let fingerprint = Fingerprint::of(conversation);
        let now_ms = unix_millis();
        {
            let mut contexts = self.lock_contexts();
            match contexts.get_mut(fingerprint.key()) {
                Some(pattern) => pattern.observe(
                    actual,
                    self.config.good_similarity,
                    self.config.context_reinforcement,
                    self.config.context_initial_confidence,
                    now_ms,
                ),
                None => {
                    contexts.insert(
                        fingerprint.key().to_owned(),
                        ContextPattern::new(
                            fingerprint.pattern().to_owned(),
                            actual,
                            self.config.context_initial_confidence,
                            now_ms,
                        ),
                    );
                }
            }
        }
        self.enforce_context_capacity();
    }

    /// Drop least recently seen patterns beyond capacity.
    fn enforce_context_capacity(&self) {
        let mut contexts = self.lock_contexts();
        let excess = contexts.len().saturating_sub(self.config.context_capacity);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(u64, String)> = contexts
            .iter()
            .map(|(k, p)| (p.last_seen_ms, k.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            contexts.remove(&key);
        }
    }

    fn lock_models(&self) -> MutexGuard<'_, Vec<PredictiveModel>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<String, ContextPattern>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lowercase and collapse whitespace.
fn normalize(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Index of the category with the most keyword hits; earlier models win ties.
fn best_match(models: &[PredictiveModel], normalized: &str) -> Option<usize> {
    let tokens = tokens(normalized);
    let mut best: Option<(usize, usize)> = None;
    for (i, model) in models.iter().enumerate() {
        let score = model.match_score(normalized, &tokens);
        if score > 0 && best.is_none_or(|(_, s)| score > s) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

async fn load_prefix_keyed<T: serde::de::DeserializeOwned>(
    store: &dyn PersistentStore,
    prefix: &str,
) -> Vec<(String, T)> {
    let keys = match store.scan_prefix(prefix).await {
        Ok(keys) if !keys.is_empty() => keys,
        Ok(_) => return Vec::new(),
        Err(e) => {
            warn!(prefix, error = %e, "cannot scan learned state");
            return Vec::new();
        }
    };
    let values = match store.mget(&keys).await {
        Ok(values) => values,
        Err(e) => {
            warn!(prefix, error = %e, "cannot load learned state");
            return Vec::new();
        }
    };
    keys.into_iter()
        .zip(values)
        .filter_map(|(key, bytes)| {
            let bytes = bytes?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => Some((key.trim_start_matches(prefix).to_owned(), value)),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable learned state");
                    None
                }
            }
        })
        .collect()
}

async fn load_prefix<T: serde::de::DeserializeOwned>(
    store: &dyn PersistentStore,
    prefix: &str,
) -> Vec<T> {
    load_prefix_keyed(store, prefix)
        .await
        .into_iter()
        .map(|(_, v)| v)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untrained_categories_stay_below_the_floor() {
        let engine = PredictionEngine::with_seed(PredictionConfig::default(), 7);
        assert!(engine.predict("hello", None).is_none());
        assert_eq!(engine.stats().withheld, 1);
    }

    #[test]
    fn lower_floor_yields_category_prediction() {
        let engine = PredictionEngine::with_seed(PredictionConfig::new().min_confidence(0.1), 7);
        let prediction = engine.predict("thanks a lot", None).unwrap();
        assert_eq!(
            prediction.source,
            PredictionSource::Category("gratitude".into())
        );
        let greeting = engine.model("gratitude").unwrap();
        assert!(greeting.candidates.iter().any(|c| c.value.text == prediction.text));
    }

    #[test]
    fn repeated_input_is_served_from_direct_cache() {
        let engine = PredictionEngine::with_seed(PredictionConfig::new().min_confidence(0.1), 1);
        let first = engine.predict("Hey there", None).unwrap();
        let second = engine.predict("hey   THERE", None).unwrap();
        assert_eq!(second.source, PredictionSource::Cached);
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn learning_invalidates_direct_cache() {
        let engine = PredictionEngine::with_seed(PredictionConfig::new().min_confidence(0.1), 1);
        let first = engine.predict("bye", None).unwrap();
        engine.learn("bye", &first.text, Some(&first.text));
        let next = engine.predict("bye", None).unwrap();
        assert_ne!(next.source, PredictionSource::Cached);
    }

    #[test]
    fn learn_without_category_is_none() {
        let engine = PredictionEngine::new(PredictionConfig::default());
        assert!(engine.learn("zqxj vbnm", "anything", None).is_none());
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("  Hello \t World "), "hello world");
    }
}
