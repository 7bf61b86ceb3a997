//! Dispatch request types

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::message::{Message, last_user_message};
use crate::HuginnError;

/// Priority class of a request.
///
/// Variant order defines `Ord`: `Ultra` is the greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    #[default]
    Normal,
    High,
    Ultra,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Low => "low",
            PriorityClass::Normal => "normal",
            PriorityClass::High => "high",
            PriorityClass::Ultra => "ultra",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = HuginnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(PriorityClass::Low),
            "normal" => Ok(PriorityClass::Normal),
            "high" => Ok(PriorityClass::High),
            "ultra" => Ok(PriorityClass::Ultra),
            other => Err(HuginnError::InvalidInput(format!(
                "unknown priority class '{other}'"
            ))),
        }
    }
}

/// A (provider, model) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A request awaiting an upstream answer.
///
/// Lives from submission until resolution; never persisted. The completion
/// handle is held by the dispatcher's queue entry, not by the request.
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub id: u64,
    pub conversation: Vec<Message>,
    /// Preferred target. `None` lets the dispatcher pick its default provider.
    pub target: Option<ModelTarget>,
    pub priority: PriorityClass,
    pub enqueued_at: Instant,
}

impl ProcessingRequest {
    pub fn new(conversation: Vec<Message>, priority: PriorityClass) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            conversation,
            target: None,
            priority,
            enqueued_at: Instant::now(),
        }
    }

    /// Pin the request to a provider/model pair.
    pub fn with_target(mut self, target: ModelTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// The user input this request answers (last user message).
    pub fn input(&self) -> &str {
        last_user_message(&self.conversation).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ultra_outranks_everything() {
        let mut classes = vec![
            PriorityClass::Low,
            PriorityClass::Ultra,
            PriorityClass::Normal,
            PriorityClass::High,
        ];
        classes.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            classes,
            [
                PriorityClass::Ultra,
                PriorityClass::High,
                PriorityClass::Normal,
                PriorityClass::Low
            ]
        );
    }

    #[test]
    fn parse_priority_class() {
        assert_eq!("ULTRA".parse::<PriorityClass>().unwrap(), PriorityClass::Ultra);
        assert!("urgent".parse::<PriorityClass>().is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = ProcessingRequest::new(vec![Message::user("a")], PriorityClass::Low);
        let b = ProcessingRequest::new(vec![Message::user("b")], PriorityClass::Low);
        assert_ne!(a.id, b.id);
        assert_eq!(b.input(), "b");
    }
}
