//! Responses remembered per short conversation window.

use serde::{Deserialize, Serialize};

use super::model::similarity;

/// The response last seen after a conversation window, with a trust score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPattern {
    /// Human-readable fingerprint pattern of the window.
    pub pattern: String,
    pub response: String,
    pub confidence: f64,
    pub observations: u64,
    pub last_seen_ms: u64,
}

impl ContextPattern {
    pub(crate) fn new(pattern: String, response: &str, confidence: f64, now_ms: u64) -> Self {
        Self {
            pattern,
            response: response.to_owned(),
            confidence,
            observations: 1,
            last_seen_ms: now_ms,
        }
    }

    /// Fold in another observation of the same window.
    ///
    /// A consistent response moves confidence toward 1 by `reinforcement`;
    /// a different one replaces the response and resets confidence.
    pub(crate) fn observe(
        &mut self,
        response: &str,
        good_similarity: f64,
        reinforcement: f64,
        initial: f64,
        now_ms: u64,
    ) {
        if similarity(&self.response, response) >= good_similarity {
            self.confidence += (1.0 - self.confidence) * reinforcement;
            self.observations += 1;
        } else {
            self.response = response.to_owned();
            self.confidence = initial;
            self.observations = 1;
        }
        self.last_seen_ms = now_ms;
    }
}
