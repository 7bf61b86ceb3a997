//! Builder for [`Orchestrator`] instances.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::Orchestrator;
use crate::cache::{CacheConfig, InMemoryStore, PersistentStore, TieredCache};
use crate::config::{Config, non_zero_period};
use crate::dispatch::{DispatcherConfig, ParallelDispatcher};
use crate::pool::{PoolManager, ProviderProfile};
use crate::prediction::{PredictionConfig, PredictionEngine};
use crate::providers::{HttpProvider, RetryConfig, UpstreamProvider};
use crate::stream::{StreamConfig, StreamOptimizer};
use crate::template::TemplateMatcher;
use crate::traits::ResponseValidator;
use crate::Result;

/// Default interval of pool maintenance and stream retuning.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Builder for configuring an [`Orchestrator`].
///
/// Providers come from two places: ones passed to
/// [`provider`](Self::provider), and `[providers.*]` sections of the config
/// that name a `base_url`, which become [`HttpProvider`]s. An explicitly
/// registered provider wins over a config section with the same name.
pub struct OrchestratorBuilder {
    config: Config,
    store: Option<Arc<dyn PersistentStore>>,
    providers: Vec<(Arc<dyn UpstreamProvider>, ProviderProfile)>,
    validator: Option<Arc<dyn ResponseValidator>>,
    templates: Option<TemplateMatcher>,
    prediction_seed: Option<u64>,
    maintenance_interval: Duration,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            store: None,
            providers: Vec::new(),
            validator: None,
            templates: None,
            prediction_seed: None,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn prediction(mut self, config: PredictionConfig) -> Self {
        self.config.prediction = config;
        self
    }

    pub fn dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.config.dispatcher = config;
        self
    }

    pub fn stream(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Persistent tier shared with other processes. Default: a fresh
    /// [`InMemoryStore`].
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an upstream provider.
    pub fn provider(
        mut self,
        provider: Arc<dyn UpstreamProvider>,
        profile: ProviderProfile,
    ) -> Self {
        self.providers.push((provider, profile));
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replace the default template rules.
    pub fn templates(mut self, templates: TemplateMatcher) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Seed the prediction sampler, for reproducible runs.
    pub fn prediction_seed(mut self, seed: u64) -> Self {
        self.prediction_seed = Some(seed);
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Build the orchestrator. Background tasks are not started.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config is invalid, a provider
    /// profile is unusable, or a config-only provider lacks a `base_url`.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        non_zero_period("maintenance_interval", Some(self.maintenance_interval))?;

        let mut pools = PoolManager::new();
        for (provider, profile) in self.providers {
            pools.register(provider, profile)?;
        }
        for (name, profile) in &config.providers {
            if pools.profile(name).is_some() {
                continue;
            }
            let provider = HttpProvider::from_profile(name, profile)?;
            pools.register(Arc::new(provider), profile.clone())?;
        }
        info!(providers = ?pools.provider_names(), "providers registered");
        let pools = Arc::new(pools);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let cache = Arc::new(TieredCache::new(config.cache.clone(), Arc::clone(&store)));
        let predictor = Arc::new(match self.prediction_seed {
            Some(seed) => PredictionEngine::with_seed(config.prediction.clone(), seed),
            None => PredictionEngine::new(config.prediction.clone()),
        });

        let mut dispatcher = ParallelDispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&pools),
            Arc::clone(&cache),
            Arc::clone(&predictor),
        )
        .with_retry(config.retry.clone());
        if let Some(validator) = self.validator {
            dispatcher = dispatcher.with_validator(validator);
        }

        Ok(Orchestrator::from_parts(
            store,
            cache,
            predictor,
            self.templates.unwrap_or_default(),
            pools,
            Arc::new(dispatcher),
            Arc::new(StreamOptimizer::new(config.stream.clone())),
            self.maintenance_interval,
        ))
    }
}
