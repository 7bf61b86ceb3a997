//! Read-only operational snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::cache::CacheStats;
use crate::dispatch::DispatchStats;
use crate::pool::PoolStats;
use crate::prediction::PredictionStats;
use crate::stream::StreamStats;
use crate::version::BuildInfo;

/// Turn counts by resolving stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnStats {
    pub total: u64,
    /// Keyed by [`SourceTag`](crate::SourceTag) name.
    pub by_source: BTreeMap<String, u64>,
    pub failures: u64,
    /// Share of turns answered without an upstream call.
    pub fast_path_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TemplateStats {
    pub hits: u64,
    pub misses: u64,
}

/// Everything the stats endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub build: BuildInfo,
    pub uptime: Duration,
    pub turns: TurnStats,
    pub cache: CacheStats,
    pub prediction: PredictionStats,
    pub templates: TemplateStats,
    pub pools: Vec<PoolStats>,
    /// Smoothed upstream latency per provider, in milliseconds.
    pub latency_ms: BTreeMap<String, f64>,
    pub dispatcher: DispatchStats,
    pub stream: StreamStats,
}

impl StatsSnapshot {
    /// Pool stats summed per provider across its models.
    pub fn pools_by_provider(&self) -> BTreeMap<String, PoolStats> {
        let mut out: BTreeMap<String, PoolStats> = BTreeMap::new();
        for pool in &self.pools {
            let entry = out.entry(pool.provider.clone()).or_insert_with(|| PoolStats {
                provider: pool.provider.clone(),
                model: "*".into(),
                ..PoolStats::default()
            });
            entry.size += pool.size;
            entry.in_use += pool.in_use;
            entry.idle += pool.idle;
            entry.waiting += pool.waiting;
            entry.created += pool.created;
            entry.reused += pool.reused;
            entry.errors += pool.errors;
            entry.retired += pool.retired;
            entry.timeouts += pool.timeouts;
            entry.served += pool.served;
        }
        out
    }
}
