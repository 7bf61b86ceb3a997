//! Pooled connection records.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::providers::UpstreamConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Busy,
}

/// One upstream connection owned by a pool.
pub struct PooledConnection {
    pub id: u64,
    pub provider: String,
    pub model: String,
    pub state: ConnectionState,
    pub requests_served: u64,
    pub errors: u64,
    pub max_requests: u64,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub(crate) upstream: Arc<dyn UpstreamConnection>,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        provider: &str,
        model: &str,
        max_requests: u64,
        upstream: Arc<dyn UpstreamConnection>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            provider: provider.to_owned(),
            model: model.to_owned(),
            state: ConnectionState::Busy,
            requests_served: 0,
            errors: 0,
            max_requests,
            created_at: now,
            last_used_at: now,
            upstream,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub fn exhausted(&self) -> bool {
        self.requests_served >= self.max_requests
    }

    /// Errors per served request.
    pub fn error_rate(&self) -> f64 {
        if self.requests_served == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests_served as f64
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("state", &self.state)
            .field("requests_served", &self.requests_served)
            .field("errors", &self.errors)
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}
