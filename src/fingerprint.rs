//! Conversation fingerprints.
//!
//! A fingerprint summarizes the last [`WINDOW_TURNS`] turns as
//! `role:first-five-words` segments joined with `|`, e.g.
//! `user:hi there|assistant:hello! how can i|user:what is rust`.
//! Cache and prediction lookups use a 128-bit content hash of that pattern.

use sha2::{Digest, Sha256};

use crate::types::Message;

/// Number of trailing turns that make up a fingerprint.
pub const WINDOW_TURNS: usize = 3;

/// Leading words kept per turn.
pub const WORDS_PER_TURN: usize = 5;

/// A conversation pattern and its cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pattern: String,
    key: String,
}

impl Fingerprint {
    /// Fingerprint the trailing window of a conversation.
    pub fn of(conversation: &[Message]) -> Self {
        Self::from_pattern(pattern(conversation))
    }

    /// Wrap an already-derived pattern string.
    pub fn from_pattern(pattern: String) -> Self {
        let key = content_key(&pattern);
        Self { pattern, key }
    }

    /// The human-readable `role:words|...` pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// 32-hex-character content hash of the pattern.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Derive the `role:words|...` pattern for the last [`WINDOW_TURNS`] turns.
pub fn pattern(conversation: &[Message]) -> String {
    let start = conversation.len().saturating_sub(WINDOW_TURNS);
    conversation[start..]
        .iter()
        .map(|m| {
            let words = m
                .content
                .split_whitespace()
                .take(WORDS_PER_TURN)
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}:{}", m.role.as_str(), words)
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// 128-bit content hash rendered as 32 lowercase hex characters.
///
/// The leading 16 bytes of SHA-256, so keys written to a persistent store
/// match across processes and builds.
pub fn content_key(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}
