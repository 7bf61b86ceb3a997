//! Huginn error types

use std::time::Duration;

/// Huginn error types
///
/// Only the dispatcher surfaces fatal errors to the orchestrator. Cache,
/// store and prediction failures are recovered locally (fail-open) and are
/// visible only through logs and stats.
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Configuration errors
    /// Unknown provider or provider/model pairing.
    #[error("provider '{provider}' with model '{model}' is not configured")]
    NotConfigured { provider: String, model: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    // Pool errors
    #[error("no connection to {provider}/{model} available within {waited:?}")]
    PoolTimeout {
        provider: String,
        model: String,
        waited: Duration,
    },

    #[error("connection pool for {provider}/{model} is shut down")]
    PoolClosed { provider: String, model: String },

    // Upstream errors
    /// A single provider call failed.
    #[error("upstream {provider}/{model} failed: {message}")]
    UpstreamFailure {
        provider: String,
        model: String,
        message: String,
        /// HTTP status, when the failure came from an HTTP response.
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    /// Every concurrent race attempt failed.
    #[error("all {} providers failed: {}", .attempts.len(), summarize(.attempts))]
    AllProvidersFailed { attempts: Vec<ProviderFailure> },

    // Store errors
    #[error("persistent store unavailable: {0}")]
    StoreUnavailable(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller's transport rejected an output unit.
    #[error("transport error: {0}")]
    Transport(String),

    // Lifecycle errors
    #[error("request dropped before completion")]
    Cancelled,
}

/// One failed attempt inside an [`HuginnError::AllProvidersFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub model: String,
    pub message: String,
}

fn summarize(attempts: &[ProviderFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}/{}: {}", a.provider, a.model, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl HuginnError {
    /// Build an upstream failure without HTTP metadata.
    pub fn upstream(
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        HuginnError::UpstreamFailure {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Whether a retry of the same logical call may succeed.
    ///
    /// Pool timeouts and network-level upstream failures are transient, as
    /// are HTTP 408, 429 and 5xx responses. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            HuginnError::PoolTimeout { .. } => true,
            HuginnError::UpstreamFailure { status, .. } => match status {
                None => true,
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }

    /// Whether this error ends the turn for the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HuginnError::NotConfigured { .. }
                | HuginnError::AllProvidersFailed { .. }
                | HuginnError::Configuration(_)
                | HuginnError::InvalidInput(_)
        )
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HuginnError::UpstreamFailure { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convert into the failure record used by race aggregation.
    pub(crate) fn into_failure(self, provider: &str, model: &str) -> ProviderFailure {
        ProviderFailure {
            provider: provider.to_owned(),
            model: model.to_owned(),
            message: self.to_string(),
        }
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;
