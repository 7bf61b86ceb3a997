//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//!
//! Every section is optional; missing sections and fields take their
//! defaults. Provider API keys are never stored in the file: a provider names
//! the environment variable that holds its key (`api_key_env`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::cache::CacheConfig;
use crate::dispatch::DispatcherConfig;
use crate::pool::ProviderProfile;
use crate::prediction::PredictionConfig;
use crate::providers::RetryConfig;
use crate::stream::StreamConfig;
use crate::{HuginnError, Result};

/// Complete Huginn configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Upstream providers by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderProfile>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.huginn/config.toml`
    /// 3. `/etc/huginn/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from(&path)
    }

    /// Load and validate one file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            HuginnError::Configuration(msg) => {
                HuginnError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| HuginnError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.providers {
            if profile.max_connections == 0 {
                return Err(HuginnError::Configuration(format!(
                    "provider '{name}': max_connections must be at least 1"
                )));
            }
            if profile.max_requests_per_connection == 0 {
                return Err(HuginnError::Configuration(format!(
                    "provider '{name}': max_requests_per_connection must be at least 1"
                )));
            }
            if profile.min_connections > profile.max_connections {
                return Err(HuginnError::Configuration(format!(
                    "provider '{name}': min_connections ({}) exceeds max_connections ({})",
                    profile.min_connections, profile.max_connections
                )));
            }
        }
        if self.dispatcher.ultra_race_fanout == 0 {
            return Err(HuginnError::Configuration(
                "dispatcher.ultra_race_fanout must be at least 1".to_string(),
            ));
        }
        if self.stream.batch_size == 0 || self.stream.buffer_bytes == 0 {
            return Err(HuginnError::Configuration(
                "stream.batch_size and stream.buffer_bytes must be at least 1".to_string(),
            ));
        }
        let periods = [
            ("dispatcher.queue_drain_interval_ms", Some(self.dispatcher.queue_drain_interval)),
            ("stream.batch_timeout_ms", Some(self.stream.batch_timeout)),
            ("stream.min_batch_timeout_ms", Some(self.stream.min_batch_timeout)),
            ("cache.sweep_interval_secs", self.cache.sweep_interval),
            ("prediction.persist_interval_secs", self.prediction.persist_interval),
        ];
        for (name, period) in periods {
            non_zero_period(name, period)?;
        }
        Ok(())
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".huginn").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/huginn/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(HuginnError::Configuration(
            "No config file found. Create ~/.huginn/config.toml or /etc/huginn/config.toml"
                .to_string(),
        ))
    }
}

/// A background or flush period must be positive when set.
pub(crate) fn non_zero_period(name: &str, period: Option<Duration>) -> Result<()> {
    match period {
        Some(p) if p.is_zero() => Err(HuginnError::Configuration(format!(
            "{name} must be greater than zero"
        ))),
        _ => Ok(()),
    }
}

/// Whole seconds.
pub(crate) fn de_secs<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_secs)
}

/// Whole seconds, where 0 disables the feature.
pub(crate) fn de_secs_opt<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    u64::deserialize(d).map(|s| (s > 0).then(|| Duration::from_secs(s)))
}

/// Whole milliseconds.
pub(crate) fn de_millis<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.cache.memory_capacity, 10_000);
        assert_eq!(config.dispatcher.ultra_race_fanout, 3);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [providers.alpha]
            max_connections = 2
            max_requests_per_connection = 50
            timeout_ms = 1500
            keep_alive = true
            min_connections = 1
            default_model = "alpha-chat"

            [providers.beta]
            default_model = "beta-large"
            base_url = "http://localhost:8080/v1"
            api_key_env = "BETA_API_KEY"

            [cache]
            memory_capacity = 500
            default_ttl_secs = 120
            sweep_interval_secs = 0

            [dispatcher]
            ultra_race_fanout = 2
            queue_drain_interval_ms = 20

            [stream]
            batch_size = 8
            batch_timeout_ms = 40
            buffer_bytes = 2048
        "#;
        let config = Config::from_toml_str(toml).unwrap();

        let alpha = &config.providers["alpha"];
        assert_eq!(alpha.max_connections, 2);
        assert_eq!(alpha.max_requests_per_connection, 50);
        assert_eq!(alpha.timeout, Duration::from_millis(1500));
        assert!(alpha.keep_alive);

        let beta = &config.providers["beta"];
        assert_eq!(beta.base_url.as_deref(), Some("http://localhost:8080/v1"));
        assert_eq!(beta.api_key_env.as_deref(), Some("BETA_API_KEY"));
        assert_eq!(beta.max_connections, ProviderProfile::default().max_connections);

        assert_eq!(config.cache.memory_capacity, 500);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(120));
        assert!(config.cache.sweep_interval.is_none());
        assert_eq!(config.dispatcher.ultra_race_fanout, 2);
        assert_eq!(
            config.dispatcher.queue_drain_interval,
            Duration::from_millis(20)
        );
        assert_eq!(config.stream.batch_size, 8);
        assert_eq!(config.stream.buffer_bytes, 2048);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [providers.alpha]
            max_connections = 0
            default_model = "m"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [providers.alpha]
            max_connections = 1
            min_connections = 2
            default_model = "m"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, HuginnError::Configuration(_)));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/huginn.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
