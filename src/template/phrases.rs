//! Ultra-common phrases answered verbatim.

/// A canned reply and how natural it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub text: &'static str,
    pub authenticity: f64,
}

/// Phrases sharing one set of replies.
#[derive(Debug, Clone)]
pub struct PhraseGroup {
    pub phrases: &'static [&'static str],
    pub variants: &'static [Variant],
}

impl PhraseGroup {
    /// The most authentic reply.
    pub fn best(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .max_by(|a, b| a.authenticity.total_cmp(&b.authenticity))
    }
}

const fn v(text: &'static str, authenticity: f64) -> Variant {
    Variant { text, authenticity }
}

pub static PHRASE_GROUPS: &[PhraseGroup] = &[
    PhraseGroup {
        phrases: &[
            "hello",
            "hi",
            "hey",
            "hello there",
            "hi there",
            "hey there",
            "good morning",
            "good afternoon",
            "good evening",
        ],
        variants: &[
            v("Hello! How can I help you today?", 0.95),
            v("Hi there! What can I do for you?", 0.92),
        ],
    },
    PhraseGroup {
        phrases: &[
            "how are you",
            "how are you doing",
            "how's it going",
            "how is it going",
        ],
        variants: &[
            v("I'm doing well, thanks for asking! How can I help you today?", 0.93),
            v("All good here! What's on your mind?", 0.9),
        ],
    },
    PhraseGroup {
        phrases: &["thanks", "thank you", "thanks a lot", "thank you so much", "thx"],
        variants: &[v("You're welcome!", 0.95), v("Happy to help!", 0.92)],
    },
    PhraseGroup {
        phrases: &["bye", "goodbye", "see you", "see you later", "good night"],
        variants: &[
            v("Goodbye! Have a great day.", 0.94),
            v("See you later!", 0.9),
        ],
    },
    PhraseGroup {
        phrases: &["ok", "okay", "cool", "great", "awesome", "got it"],
        variants: &[v("Great! Let me know if there's anything else.", 0.9)],
    },
];
