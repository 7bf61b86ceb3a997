//! Turn results and outbound transport units

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which cascade stage produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Prediction,
    Cache,
    PreGenerated,
    Template,
    /// Winner of a multi-provider race.
    Parallel,
    /// Single upstream call through the priority queue.
    Upstream,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Prediction => "prediction",
            SourceTag::Cache => "cache",
            SourceTag::PreGenerated => "pregenerated",
            SourceTag::Template => "template",
            SourceTag::Parallel => "parallel",
            SourceTag::Upstream => "upstream",
        }
    }

    /// Whether the stage avoided an upstream call.
    pub fn is_fast_path(&self) -> bool {
        !matches!(self, SourceTag::Parallel | SourceTag::Upstream)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict returned by a [`ResponseValidator`](crate::ResponseValidator).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub is_valid: bool,
    pub should_retry: bool,
    /// Quality in `[0, 1]`.
    pub score: f64,
}

/// The answer to one user turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub text: String,
    pub source: SourceTag,
    /// Stage confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

/// Kind of an [`OutputUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Chunk,
    Complete,
    Error,
}

/// Ordered unit pushed to a [`TransportSink`](crate::TransportSink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputUnit {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub payload: String,
}

impl OutputUnit {
    pub fn chunk(payload: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Chunk,
            payload: payload.into(),
        }
    }

    pub fn complete(payload: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Complete,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            payload: payload.into(),
        }
    }
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}
