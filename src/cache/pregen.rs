//! Ranked pre-generated candidates per conversation pattern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::response::unix_millis;
use crate::types::estimate_tokens;

/// A vetted response kept ready for a recurring pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreGeneratedCandidate {
    pub pattern: String,
    pub response_text: String,
    pub quality_score: f64,
    pub token_estimate: u32,
    /// Wall-clock creation time, Unix milliseconds.
    pub created_at_ms: u64,
}

impl PreGeneratedCandidate {
    pub fn new(pattern: impl Into<String>, response_text: impl Into<String>, quality: f64) -> Self {
        let response_text = response_text.into();
        Self {
            pattern: pattern.into(),
            token_estimate: estimate_tokens(&response_text),
            response_text,
            quality_score: quality,
            created_at_ms: unix_millis(),
        }
    }

    /// Whether the candidate is older than `retention` at `now_ms`.
    pub fn is_older_than(&self, retention: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > retention.as_millis() as u64
    }
}

/// Insert into a list kept sorted by descending quality, capped at `max`.
///
/// A candidate whose text is already present only replaces the existing one
/// when it scores higher, so repeating an insertion is a no-op. Returns
/// whether the list changed.
pub(crate) fn insert_ranked(
    list: &mut Vec<PreGeneratedCandidate>,
    candidate: PreGeneratedCandidate,
    max: usize,
) -> bool {
    if let Some(existing) = list
        .iter_mut()
        .find(|c| c.response_text == candidate.response_text)
    {
        if candidate.quality_score <= existing.quality_score {
            return false;
        }
        *existing = candidate;
    } else {
        if list.len() >= max
            && list
                .last()
                .is_some_and(|worst| worst.quality_score >= candidate.quality_score)
        {
            return false;
        }
        list.push(candidate);
    }

    list.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
    list.truncate(max);
    true
}

/// Drop candidates older than `retention`. Returns the number removed.
pub(crate) fn retain_fresh(
    list: &mut Vec<PreGeneratedCandidate>,
    retention: Duration,
    now_ms: u64,
) -> usize {
    let before = list.len();
    list.retain(|c| !c.is_older_than(retention, now_ms));
    before - list.len()
}
