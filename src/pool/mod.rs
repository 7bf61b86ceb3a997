//! Connection pooling per (provider, model).
//!
//! [`PoolManager`] owns the registered providers and lazily creates one
//! [`ConnectionPool`] per (provider, model) pair. Every upstream call goes
//! through [`PoolManager::execute`] or [`PoolManager::execute_stream`], which
//! bound the call by the provider's timeout, record latency and metrics, and
//! release the connection with the call's outcome.

mod connection;
mod pair;
mod profile;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::instrument;

pub use connection::{ConnectionState, PooledConnection};
pub use pair::{ConnectionHandle, ConnectionPool, MaintenanceReport, PoolStats};
pub use profile::ProviderProfile;

use crate::providers::{
    CompletionRequest, DEFAULT_FRAGMENT_BUFFER, FragmentStream, LatencyBoard, UpstreamConnection,
    UpstreamProvider, bounded_stream_with,
};
use crate::types::PriorityClass;
use crate::{HuginnError, Result, telemetry};

struct ProviderEntry {
    provider: Arc<dyn UpstreamProvider>,
    profile: ProviderProfile,
}

/// Registry of providers and their connection pools.
#[derive(Default)]
pub struct PoolManager {
    providers: BTreeMap<String, ProviderEntry>,
    pools: RwLock<HashMap<(String, String), Arc<ConnectionPool>>>,
    latency: Arc<LatencyBoard>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    ///
    /// Re-registering a name replaces the previous provider. Pools already
    /// created for it keep the old one until they are drained.
    pub fn register(
        &mut self,
        provider: Arc<dyn UpstreamProvider>,
        profile: ProviderProfile,
    ) -> Result<()> {
        let name = provider.name().to_owned();
        if profile.max_connections == 0 {
            return Err(HuginnError::Configuration(format!(
                "provider '{name}': max_connections must be at least 1"
            )));
        }
        if profile.default_model.is_empty() {
            return Err(HuginnError::Configuration(format!(
                "provider '{name}' has no default_model"
            )));
        }
        self.providers
            .insert(name, ProviderEntry { provider, profile });
        Ok(())
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn profile(&self, provider: &str) -> Option<&ProviderProfile> {
        self.providers.get(provider).map(|e| &e.profile)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The pool for a pair, created on first use.
    pub fn pool(&self, provider: &str, model: &str) -> Result<Arc<ConnectionPool>> {
        let entry = self
            .providers
            .get(provider)
            .filter(|e| e.profile.serves(model))
            .ok_or_else(|| HuginnError::NotConfigured {
                provider: provider.to_owned(),
                model: model.to_owned(),
            })?;
        let key = (provider.to_owned(), model.to_owned());
        {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(pool) = pools.get(&key) {
                return Ok(Arc::clone(pool));
            }
        }
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.entry(key).or_insert_with(|| {
            ConnectionPool::new(Arc::clone(&entry.provider), model, entry.profile.clone())
        });
        Ok(Arc::clone(pool))
    }

    pub async fn acquire(&self, provider: &str, model: &str) -> Result<ConnectionHandle> {
        self.acquire_with_priority(provider, model, PriorityClass::Normal)
            .await
    }

    pub async fn acquire_with_priority(
        &self,
        provider: &str,
        model: &str,
        priority: PriorityClass,
    ) -> Result<ConnectionHandle> {
        self.pool(provider, model)?.acquire(priority).await
    }

    /// Return a connection with the outcome of the request it served.
    pub fn release(&self, handle: ConnectionHandle, ok: bool) {
        handle.release(ok);
    }

    /// Run `f` on a pooled connection.
    ///
    /// The call is bounded by the provider's `timeout`; the connection is
    /// released with the outcome whatever happens.
    #[instrument(skip(self, f))]
    pub async fn execute<F, Fut, T>(
        &self,
        provider: &str,
        model: &str,
        priority: PriorityClass,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn UpstreamConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool = self.pool(provider, model)?;
        let handle = pool.acquire(priority).await?;
        let timeout = pool.profile().timeout;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, f(handle.upstream())).await {
            Ok(result) => result,
            Err(_) => Err(HuginnError::upstream(
                provider,
                model,
                format!("request timed out after {timeout:?}"),
            )),
        };
        self.observe(provider, started.elapsed(), result.is_ok());
        handle.release(result.is_ok());
        result
    }

    /// Start a streamed completion on a pooled connection.
    ///
    /// The connection stays checked out until the stream ends or is dropped.
    /// Fragments pass through a bounded channel.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn execute_stream(
        &self,
        provider: &str,
        priority: PriorityClass,
        request: &CompletionRequest,
    ) -> Result<FragmentStream> {
        let pool = self.pool(provider, &request.model)?;
        let handle = pool.acquire(priority).await?;
        let timeout = pool.profile().timeout;
        let started = Instant::now();
        let upstream = handle.upstream();
        let stream = match tokio::time::timeout(timeout, upstream.complete_stream(request)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.observe(provider, started.elapsed(), false);
                handle.release(false);
                return Err(e);
            }
            Err(_) => {
                self.observe(provider, started.elapsed(), false);
                handle.release(false);
                return Err(HuginnError::upstream(
                    provider,
                    &request.model,
                    format!("stream did not start within {timeout:?}"),
                ));
            }
        };
        let latency = Arc::clone(&self.latency);
        let provider = provider.to_owned();
        Ok(bounded_stream_with(
            stream,
            DEFAULT_FRAGMENT_BUFFER,
            move |ok| {
                record_call(&latency, &provider, started.elapsed(), ok);
                handle.release(ok);
            },
        ))
    }

    fn observe(&self, provider: &str, elapsed: Duration, ok: bool) {
        record_call(&self.latency, provider, elapsed, ok);
    }

    fn pools_snapshot(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Run one maintenance pass over every pool.
    pub async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for pool in self.pools_snapshot() {
            report.merge(pool.maintain().await);
        }
        report
    }

    /// Open the keep-alive floor for every provider's default model.
    pub async fn warm_up(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for (name, entry) in &self.providers {
            if !entry.profile.keep_alive {
                continue;
            }
            if let Ok(pool) = self.pool(name, &entry.profile.default_model) {
                report.merge(pool.maintain().await);
            }
        }
        report
    }

    /// Close every pool and wait for checked-out connections.
    ///
    /// Returns `false` if any pool still had connections out at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let pools = self.pools_snapshot();
        let results =
            futures_util::future::join_all(pools.iter().map(|p| p.drain(timeout))).await;
        results.into_iter().all(|drained| drained)
    }

    /// Stats for every pool, sorted by provider then model.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools_snapshot().iter().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        stats
    }

    pub fn latency(&self) -> &Arc<LatencyBoard> {
        &self.latency
    }
}

fn record_call(latency: &LatencyBoard, provider: &str, elapsed: Duration, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(
        telemetry::UPSTREAM_REQUESTS_TOTAL,
        "provider" => provider.to_owned(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        telemetry::UPSTREAM_DURATION_SECONDS,
        "provider" => provider.to_owned()
    )
    .record(elapsed.as_secs_f64());
    if ok {
        latency.record(provider, elapsed);
    }
}
