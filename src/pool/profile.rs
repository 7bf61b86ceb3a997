//! Per-provider pool settings.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{de_millis, de_secs};

/// Connection and request limits for one upstream provider.
///
/// Applies to every (provider, model) pool of that provider.
///
/// ```toml
/// [providers.openai]
/// base_url = "https://api.openai.com/v1"
/// api_key_env = "OPENAI_API_KEY"
/// default_model = "gpt-4o-mini"
/// max_connections = 8
/// timeout_ms = 20000
/// keep_alive = true
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderProfile {
    /// Live connections per (provider, model). Default: 4.
    pub max_connections: usize,
    /// Requests a connection serves before it is retired. Default: 100.
    pub max_requests_per_connection: u64,
    /// Bound on each upstream call. Default: 30s.
    #[serde(rename = "timeout_ms", deserialize_with = "de_millis")]
    pub timeout: Duration,
    /// Keep `min_connections` open between requests. Default: false.
    pub keep_alive: bool,
    /// Pool floor maintained for keep-alive providers. Default: 1.
    pub min_connections: usize,
    /// How long `acquire` waits for a free connection. Default: 5s.
    #[serde(rename = "acquire_timeout_ms", deserialize_with = "de_millis")]
    pub acquire_timeout: Duration,
    /// Idle connections unused this long are retired. Default: 5 minutes.
    #[serde(rename = "max_idle_secs", deserialize_with = "de_secs")]
    pub max_idle: Duration,
    /// Idle connections older than this are retired. Default: 10 minutes.
    #[serde(rename = "max_age_secs", deserialize_with = "de_secs")]
    pub max_age: Duration,
    /// Served requests before the error rate is judged. Default: 10.
    pub error_rate_min_requests: u64,
    /// Error rate above which a connection is retired. Default: 0.3.
    pub error_rate_threshold: f64,
    /// Model used when a request names only the provider.
    pub default_model: String,
    /// Further models this provider may serve. Empty allows any model.
    pub models: Vec<String>,
    /// Endpoint for HTTP providers.
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_requests_per_connection: 100,
            timeout: Duration::from_secs(30),
            keep_alive: false,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(10 * 60),
            error_rate_min_requests: 10,
            error_rate_threshold: 0.3,
            default_model: String::new(),
            models: Vec::new(),
            base_url: None,
            api_key_env: None,
        }
    }
}

impl ProviderProfile {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            ..Self::default()
        }
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_requests_per_connection(mut self, n: u64) -> Self {
        self.max_requests_per_connection = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, min_connections: usize) -> Self {
        self.keep_alive = true;
        self.min_connections = min_connections;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Whether this provider may serve `model`.
    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty()
            || model == self.default_model
            || self.models.iter().any(|m| m == model)
    }
}
