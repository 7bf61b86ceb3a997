//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (prometheus, statsd, ...);
//! without one, every metric call is a no-op.
//!
//! # Naming
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms carry their unit (`_seconds`).
//!
//! # Common labels
//!
//! - `stage` - answering stage: "prediction", "cache", "pregenerated", "template",
//!   "parallel" or "upstream"
//! - `provider` - upstream provider name
//! - `tier` - cache tier: "memory" or "persistent"
//! - `status` - "ok" or "error"

/// Turns resolved, by the stage that produced the answer.
///
/// Labels: `stage`.
pub const TURNS_TOTAL: &str = "huginn_turns_total";

/// End-to-end turn latency in seconds.
///
/// Labels: `stage`.
pub const TURN_DURATION_SECONDS: &str = "huginn_turn_duration_seconds";

/// Cache hits.
///
/// Labels: `tier`.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Cache misses (both tiers missed).
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Memory-tier entries removed by capacity eviction.
pub const CACHE_EVICTIONS_TOTAL: &str = "huginn_cache_evictions_total";

/// Persistent-store errors recovered as misses.
///
/// Labels: `operation`.
pub const STORE_ERRORS_TOTAL: &str = "huginn_store_errors_total";

/// Upstream calls made through the pool.
///
/// Labels: `provider`, `status`.
pub const UPSTREAM_REQUESTS_TOTAL: &str = "huginn_upstream_requests_total";

/// Upstream call duration in seconds.
///
/// Labels: `provider`.
pub const UPSTREAM_DURATION_SECONDS: &str = "huginn_upstream_duration_seconds";

/// Pool acquisitions that timed out.
///
/// Labels: `provider`.
pub const POOL_TIMEOUTS_TOTAL: &str = "huginn_pool_timeouts_total";

/// Connections retired (age, request ceiling, error rate).
///
/// Labels: `provider`, `reason`.
pub const POOL_RETIRED_TOTAL: &str = "huginn_pool_retired_total";

/// Races won, by winning provider.
///
/// Labels: `provider`.
pub const RACES_WON_TOTAL: &str = "huginn_races_won_total";

/// Retry attempts (not counting the initial request).
///
/// Labels: `provider`.
pub const RETRIES_TOTAL: &str = "huginn_retries_total";

/// Prediction learning events.
pub const LEARN_EVENTS_TOTAL: &str = "huginn_learn_events_total";

/// Stream batches flushed to the transport.
pub const STREAM_FLUSHES_TOTAL: &str = "huginn_stream_flushes_total";
