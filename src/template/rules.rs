//! Pattern → template rules with placeholder filling.

use crate::types::{Message, Role};

/// How a rule recognizes its input (all matching is on normalized text).
#[derive(Debug, Clone, PartialEq)]
pub enum RuleMatcher {
    /// Input starts with one of the phrases. The rest becomes `{topic}`.
    Prefix(Vec<String>),
    /// Input contains one of the phrases as whole words.
    Contains(Vec<String>),
    /// Input contains every keyword.
    AllKeywords(Vec<String>),
}

/// One pattern → template rule.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRule {
    pub id: String,
    /// Higher runs first.
    pub priority: u8,
    pub matcher: RuleMatcher,
    /// Response text; `{topic}` and `{name}` are filled from the input and
    /// conversation. A rule whose placeholder cannot be filled is skipped.
    pub template: String,
    pub authenticity: f64,
    /// Longer inputs are left to the upstream.
    pub max_words: Option<usize>,
}

impl TemplateRule {
    pub fn new(
        id: impl Into<String>,
        priority: u8,
        matcher: RuleMatcher,
        template: impl Into<String>,
        authenticity: f64,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            matcher,
            template: template.into(),
            authenticity,
            max_words: None,
        }
    }

    pub fn max_words(mut self, n: usize) -> Self {
        self.max_words = Some(n);
        self
    }

    /// Render the rule against normalized input, if it applies.
    pub(crate) fn apply(&self, normalized: &str, context: &[Message]) -> Option<String> {
        let words = normalized.split(' ').filter(|w| !w.is_empty()).count();
        if self.max_words.is_some_and(|max| words > max) {
            return None;
        }

        let topic = match &self.matcher {
            RuleMatcher::Prefix(prefixes) => {
                let rest = prefixes.iter().find_map(|p| strip_word_prefix(normalized, p))?;
                Some(topic_of(rest))
            }
            RuleMatcher::Contains(phrases) => {
                phrases.iter().any(|p| contains_words(normalized, p)).then_some(None)?
            }
            RuleMatcher::AllKeywords(keywords) => keywords
                .iter()
                .all(|k| contains_words(normalized, k))
                .then_some(None)?,
        };

        let mut text = self.template.clone();
        if text.contains("{topic}") {
            let topic = topic.filter(|t| !t.is_empty())?;
            text = text.replace("{topic}", &topic);
        }
        if text.contains("{name}") {
            let name = name_from(context)?;
            text = text.replace("{name}", &name);
        }
        Some(text)
    }
}

/// Built-in rules, unsorted.
pub fn default_rules() -> Vec<TemplateRule> {
    let words = |ws: &[&str]| ws.iter().map(|w| (*w).to_owned()).collect::<Vec<_>>();
    vec![
        TemplateRule::new(
            "introduction",
            90,
            RuleMatcher::Prefix(words(&["my name is", "call me", "i am called"])),
            "Nice to meet you, {name}! What can I do for you?",
            0.92,
        )
        .max_words(5),
        TemplateRule::new(
            "thanks_for",
            80,
            RuleMatcher::Prefix(words(&["thanks for", "thank you for", "thanks so much for"])),
            "You're welcome! Glad I could help with {topic}.",
            0.86,
        )
        .max_words(10),
        TemplateRule::new(
            "apology",
            60,
            RuleMatcher::Contains(words(&["sorry", "my bad", "apologies"])),
            "No worries at all!",
            0.82,
        )
        .max_words(6),
        TemplateRule::new(
            "agreement",
            50,
            RuleMatcher::Contains(words(&["sounds good", "makes sense", "that works", "perfect"])),
            "Great! Let me know if anything else comes up.",
            0.82,
        )
        .max_words(6),
        TemplateRule::new(
            "wellbeing",
            40,
            RuleMatcher::Prefix(words(&["i'm good", "i'm fine", "i am good", "i am fine", "doing well"])),
            "Glad to hear it! What's on your mind?",
            0.84,
        )
        .max_words(6),
        TemplateRule::new(
            "nice_to_meet",
            30,
            RuleMatcher::AllKeywords(words(&["nice", "meet", "you"])),
            "Nice to meet you too, {name}!",
            0.88,
        )
        .max_words(8),
    ]
}

/// Rest of `text` after a whole-word `prefix`.
fn strip_word_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(' ') {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn contains_words(text: &str, phrase: &str) -> bool {
    format!(" {text} ").contains(&format!(" {phrase} "))
}

fn topic_of(rest: &str) -> String {
    rest.split(' ')
        .filter(|w| !w.is_empty())
        .take(8)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A name the user introduced, most recent first.
pub(crate) fn name_from(context: &[Message]) -> Option<String> {
    const MARKERS: &[&str] = &["my name is ", "call me ", "i am called "];
    context
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .find_map(|m| {
            let lower = m.content.to_lowercase();
            MARKERS.iter().find_map(|marker| {
                let start = lower.find(marker)? + marker.len();
                let word: String = m
                    .content
                    .get(start..)?
                    .chars()
                    .take_while(|c| c.is_alphabetic() || *c == '-')
                    .collect();
                capitalize(&word)
            })
        })
}

fn capitalize(word: &str) -> Option<String> {
    let mut chars = word.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_requires_word_boundary() {
        assert_eq!(strip_word_prefix("hi there", "hi"), Some("there"));
        assert_eq!(strip_word_prefix("hi", "hi"), Some(""));
        assert_eq!(strip_word_prefix("hiking", "hi"), None);
    }

    #[test]
    fn name_is_extracted_from_latest_user_turn() {
        let context = vec![
            Message::user("my name is ada"),
            Message::assistant("Nice to meet you."),
            Message::user("Actually, call me Grace."),
        ];
        assert_eq!(name_from(&context).as_deref(), Some("Grace"));
        assert_eq!(name_from(&[Message::assistant("my name is Bot")]), None);
    }

    #[test]
    fn topic_placeholder_is_filled() {
        let rule = &default_rules()[1];
        let text = rule.apply("thanks for the recipe", &[]).unwrap();
        assert_eq!(text, "You're welcome! Glad I could help with the recipe.");
    }

    #[test]
    fn unfillable_placeholder_skips_rule() {
        let rule = &default_rules()[5];
        assert!(rule.apply("nice to meet you", &[]).is_none());
        let context = [Message::user("my name is Sam")];
        assert_eq!(
            rule.apply("nice to meet you", &context).as_deref(),
            Some("Nice to meet you too, Sam!")
        );
    }

    #[test]
    fn introduction_reads_name_from_current_turn() {
        let rule = &default_rules()[0];
        let context = [Message::user("My name is Lin")];
        assert_eq!(
            rule.apply("my name is lin", &context).as_deref(),
            Some("Nice to meet you, Lin! What can I do for you?")
        );
    }

    #[test]
    fn long_inputs_are_not_hijacked() {
        let rule = &default_rules()[2];
        assert!(rule.apply("sorry", &[]).is_some());
        assert!(rule
            .apply("sorry but can you explain how the borrow checker works", &[])
            .is_none());
    }
}
