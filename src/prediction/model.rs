//! Keyword categories with weighted candidate responses.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::sampling::WeightedDistribution;

/// Lower bound for a candidate's probability after a learning nudge.
pub const MIN_PROBABILITY: f64 = 0.05;
/// Upper bound for a candidate's probability after a learning nudge.
pub const MAX_PROBABILITY: f64 = 0.5;

/// Emotional register of a candidate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Empathetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResponse {
    pub text: String,
    pub sentiment: Sentiment,
}

/// A category of inputs and the responses it tends to receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveModel {
    pub id: String,
    /// Words or phrases that put an input in this category.
    pub category_pattern: Vec<String>,
    pub candidates: WeightedDistribution<CandidateResponse>,
    /// Moving average of how similar predictions were to actual responses.
    pub accuracy: f64,
    pub usage_count: u64,
}

/// Tuning for [`PredictiveModel::learn`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct LearnParams {
    pub learning_rate: f64,
    pub accuracy_smoothing: f64,
    pub good_similarity: f64,
    pub novel_similarity: f64,
    pub max_candidates: usize,
}

impl PredictiveModel {
    /// A model whose candidates start equally likely, with accuracy 0.5.
    pub fn new(
        id: impl Into<String>,
        keywords: &[&str],
        candidates: &[(&str, Sentiment)],
    ) -> Self {
        Self {
            id: id.into(),
            category_pattern: keywords.iter().map(|k| k.to_lowercase()).collect(),
            candidates: WeightedDistribution::new(candidates.iter().map(|(text, sentiment)| {
                (
                    CandidateResponse {
                        text: (*text).to_owned(),
                        sentiment: *sentiment,
                    },
                    1.0,
                )
            })),
            accuracy: 0.5,
            usage_count: 0,
        }
    }

    /// Number of category keywords present in the input.
    ///
    /// Single words must match a whole token; phrases and punctuation match
    /// as substrings of the lowercased input.
    pub fn match_score(&self, normalized: &str, tokens: &HashSet<String>) -> usize {
        self.category_pattern
            .iter()
            .filter(|k| {
                if k.chars().all(char::is_alphanumeric) {
                    tokens.contains(k.as_str())
                } else {
                    normalized.contains(k.as_str())
                }
            })
            .count()
    }

    /// Confidence for a candidate with probability `p`.
    pub fn confidence_for(&self, p: f64) -> f64 {
        (self.accuracy * (0.5 + p)).clamp(0.0, 1.0)
    }

    /// Apply one learning event. Returns the observed similarity.
    ///
    /// The candidate that was predicted (or, failing that, the one closest to
    /// `actual`) is nudged up when the similarity is good and down otherwise,
    /// bounded to `[MIN_PROBABILITY, MAX_PROBABILITY]` before the whole
    /// distribution is renormalized.
    pub(crate) fn learn(&mut self, predicted: Option<&str>, actual: &str, params: LearnParams) -> f64 {
        let predicted_index = predicted.and_then(|p| {
            self.candidates
                .iter()
                .position(|c| c.value.text == p)
        });
        let (index, similarity) = match (predicted_index, predicted) {
            (Some(i), Some(p)) => (Some(i), similarity(p, actual)),
            (None, Some(p)) => (self.closest(actual).map(|(i, _)| i), similarity(p, actual)),
            _ => match self.closest(actual) {
                Some((i, s)) => (Some(i), s),
                None => (None, 0.0),
            },
        };

        if let Some(index) = index {
            let delta = if similarity >= params.good_similarity {
                params.learning_rate
            } else {
                -params.learning_rate
            };
            self.candidates
                .adjust(index, |p| (p + delta).clamp(MIN_PROBABILITY, MAX_PROBABILITY));
        }

        let novel = self
            .closest(actual)
            .is_none_or(|(_, s)| s < params.novel_similarity);
        if novel && self.candidates.len() < params.max_candidates && !actual.trim().is_empty() {
            self.candidates.push(
                CandidateResponse {
                    text: actual.trim().to_owned(),
                    sentiment: Sentiment::Neutral,
                },
                MIN_PROBABILITY,
            );
        }

        self.accuracy += params.accuracy_smoothing * (similarity - self.accuracy);
        self.accuracy = self.accuracy.clamp(0.0, 1.0);
        self.usage_count += 1;
        similarity
    }

    fn closest(&self, text: &str) -> Option<(usize, f64)> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, similarity(&c.value.text, text)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Lowercased alphanumeric tokens.
pub fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token-set Jaccard similarity. Two empty texts are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(&b).count();
    let intersection = a.intersection(&b).count();
    intersection as f64 / union as f64
}

/// The built-in categories.
pub fn default_models() -> Vec<PredictiveModel> {
    use Sentiment::*;
    vec![
        PredictiveModel::new(
            "greeting",
            &["hello", "hi", "hey", "howdy", "greetings", "good morning", "good afternoon", "good evening"],
            &[
                ("Hello! How can I help you today?", Positive),
                ("Hi there! What's on your mind?", Positive),
                ("Hey! Good to see you. What can I do for you?", Positive),
            ],
        ),
        PredictiveModel::new(
            "gratitude",
            &["thanks", "thank you", "thx", "appreciate", "grateful", "cheers"],
            &[
                ("You're welcome!", Positive),
                ("Happy to help!", Positive),
                ("Anytime! Let me know if you need anything else.", Positive),
            ],
        ),
        PredictiveModel::new(
            "farewell",
            &["bye", "goodbye", "see you", "good night", "farewell", "take care", "later"],
            &[
                ("Goodbye! Take care.", Positive),
                ("See you later!", Positive),
                ("Bye! Have a great day.", Positive),
            ],
        ),
        PredictiveModel::new(
            "help",
            &["help", "assist", "support", "stuck", "problem", "issue", "how do i", "can you"],
            &[
                ("I'd be happy to help. What do you need?", Empathetic),
                ("Sure, I can help with that. Can you tell me a bit more?", Empathetic),
                ("Of course. What are you working on?", Neutral),
            ],
        ),
        PredictiveModel::new(
            "question",
            &["what", "why", "how", "when", "where", "who", "which", "?"],
            &[
                ("Good question. Let me think about that.", Neutral),
                ("That's a great question. Here's what I know.", Positive),
                ("Let me explain.", Neutral),
            ],
        ),
        PredictiveModel::new(
            "casual",
            &["lol", "haha", "cool", "nice", "awesome", "ok", "okay", "sure", "yeah"],
            &[
                ("Ha, nice!", Positive),
                ("Cool!", Positive),
                ("Sounds good.", Neutral),
            ],
        ),
    ]
}
