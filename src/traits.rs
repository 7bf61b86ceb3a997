//! Collaborator traits supplied by the embedding application.
//!
//! Huginn does not score authenticity or own a transport. The host wires in
//! a [`ResponseValidator`] (consulted after dispatch, before a response is
//! cached or learned from) and a [`TransportSink`] (receives ordered output
//! units on the streaming path).

use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{Message, OutputUnit, Validation};
use crate::{HuginnError, Result};

/// Scores an upstream response before the turn is finalized.
#[async_trait]
pub trait ResponseValidator: Send + Sync {
    async fn validate(
        &self,
        response: &str,
        history: &[Message],
        user_message: &str,
    ) -> Validation;
}

/// Delivers ordered output units to the caller.
///
/// The stream optimizer is the only producer of `chunk` units.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn push(&self, unit: OutputUnit) -> Result<()>;
}

/// Sink that records every unit in memory.
///
/// Useful for tests and for callers that want the whole transcript at once.
#[derive(Debug, Default)]
pub struct CollectingSink {
    units: Mutex<Vec<OutputUnit>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything pushed so far.
    pub fn units(&self) -> Vec<OutputUnit> {
        self.units.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TransportSink for CollectingSink {
    async fn push(&self, unit: OutputUnit) -> Result<()> {
        self.units
            .lock()
            .map_err(|_| HuginnError::Transport("collecting sink poisoned".into()))?
            .push(unit);
        Ok(())
    }
}
