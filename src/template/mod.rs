//! Rule-based fast path that never calls upstream.
//!
//! Matching runs in two phases:
//!
//! 1. ultra-common phrases ([`phrases::PHRASE_GROUPS`]) by exact match, or
//!    by whole-word containment in very short inputs, answered with the
//!    group's most authentic variant;
//! 2. priority-sorted [`TemplateRule`]s, first match wins, with `{topic}`
//!    and `{name}` filled from the input and conversation.

pub mod phrases;
pub mod rules;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

pub use rules::{RuleMatcher, TemplateRule, default_rules};

use crate::types::{Message, estimate_tokens};
use phrases::PHRASE_GROUPS;

/// Extra words allowed around an ultra-common phrase.
const PHRASE_SLACK_WORDS: usize = 2;

/// A template response.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    pub text: String,
    pub estimated_authenticity: f64,
    pub token_estimate: u32,
    /// Phrase or rule id that produced the match.
    pub rule: String,
}

/// Two-phase template matcher.
#[derive(Debug)]
pub struct TemplateMatcher {
    rules: Vec<TemplateRule>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self::with_rules(default_rules())
    }
}

impl TemplateMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matcher with a custom phase-2 rule set.
    pub fn with_rules(mut rules: Vec<TemplateRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Add a rule, keeping priority order. Equal priorities keep insertion order.
    pub fn add_rule(&mut self, rule: TemplateRule) {
        let at = self.rules.partition_point(|r| r.priority >= rule.priority);
        self.rules.insert(at, rule);
    }

    pub fn rules(&self) -> &[TemplateRule] {
        &self.rules
    }

    /// Match `input` against both phases.
    ///
    /// `context` is the conversation, used to fill placeholders.
    pub fn match_input(&self, input: &str, context: &[Message]) -> Option<TemplateMatch> {
        let normalized = normalize(input);
        if normalized.is_empty() {
            return None;
        }

        let found = match_phrase(&normalized).or_else(|| {
            self.rules.iter().find_map(|rule| {
                rule.apply(&normalized, context).map(|text| TemplateMatch {
                    token_estimate: estimate_tokens(&text),
                    text,
                    estimated_authenticity: rule.authenticity,
                    rule: rule.id.clone(),
                })
            })
        });

        match &found {
            Some(m) => {
                debug!(rule = %m.rule, authenticity = m.estimated_authenticity, "template match");
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// `(hits, misses)` since construction.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

fn match_phrase(normalized: &str) -> Option<TemplateMatch> {
    let words = normalized.split(' ').count();
    let padded = format!(" {normalized} ");

    let mut best: Option<(&'static str, usize)> = None;
    for (group_index, group) in PHRASE_GROUPS.iter().enumerate() {
        for phrase in group.phrases {
            if *phrase == normalized {
                return render(group_index, phrase);
            }
            let phrase_words = phrase.split(' ').count();
            let fits = words <= phrase_words + PHRASE_SLACK_WORDS;
            let longer = best.is_none_or(|(p, _)| phrase.len() > p.len());
            if fits && longer && padded.contains(&format!(" {phrase} ")) {
                best = Some((phrase, group_index));
            }
        }
    }
    best.and_then(|(phrase, group_index)| render(group_index, phrase))
}

fn render(group_index: usize, phrase: &str) -> Option<TemplateMatch> {
    let variant = PHRASE_GROUPS.get(group_index)?.best()?;
    Some(TemplateMatch {
        text: variant.text.to_owned(),
        estimated_authenticity: variant.authenticity,
        token_estimate: estimate_tokens(variant.text),
        rule: format!("phrase:{phrase}"),
    })
}

/// Lowercase, drop punctuation other than apostrophes, collapse whitespace.
fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize("  Hello,  World!! "), "hello world");
        assert_eq!(normalize("I'm fine."), "i'm fine");
    }

    #[test]
    fn exact_phrase_returns_best_variant() {
        let m = TemplateMatcher::new().match_input("Hello!", &[]).unwrap();
        assert_eq!(m.text, "Hello! How can I help you today?");
        assert!(m.estimated_authenticity >= 0.9);
        assert_eq!(m.rule, "phrase:hello");
    }

    #[test]
    fn short_input_containing_phrase_matches_longest_phrase() {
        let m = TemplateMatcher::new().match_input("oh hi there", &[]).unwrap();
        assert_eq!(m.rule, "phrase:hi there");
    }

    #[test]
    fn long_input_does_not_match_phrase() {
        let matcher = TemplateMatcher::new();
        assert!(matcher
            .match_input("hi can you explain lifetimes in detail", &[])
            .is_none());
        assert_eq!(matcher.counts(), (0, 1));
    }

    #[test]
    fn rules_run_in_priority_order() {
        let mut matcher = TemplateMatcher::with_rules(Vec::new());
        matcher.add_rule(TemplateRule::new(
            "low",
            1,
            RuleMatcher::Contains(vec!["widget".into()]),
            "low",
            0.5,
        ));
        matcher.add_rule(TemplateRule::new(
            "high",
            9,
            RuleMatcher::Contains(vec!["widget".into()]),
            "high",
            0.5,
        ));
        let m = matcher.match_input("the widget broke", &[]).unwrap();
        assert_eq!(m.rule, "high");
    }

    #[test]
    fn phase_two_rule_with_topic() {
        let m = TemplateMatcher::new()
            .match_input("Thanks for the explanation!", &[])
            .unwrap();
        assert_eq!(m.rule, "thanks_for");
        assert!(m.text.contains("the explanation"));
    }
}
