//! Huginn - latency-minimizing core for multi-provider chat serving
//!
//! Each conversational turn runs through a cascade of progressively more
//! expensive stages and stops at the first that can answer: a learned
//! prediction, a tiered response cache, a template, and finally a pooled,
//! prioritized (and for `ultra` requests, raced) upstream call. Upstream
//! answers stream through an adaptive batcher and are fed back into the
//! cache and predictor so later turns resolve locally.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use huginn::{HttpProvider, Message, Orchestrator, PriorityClass, ProviderProfile};
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let provider = HttpProvider::new(
//!         "openai",
//!         "https://api.openai.com/v1",
//!         Some("sk-your-key".into()),
//!         Duration::from_secs(30),
//!     )?;
//!     let orchestrator = Arc::new(
//!         Orchestrator::builder()
//!             .provider(
//!                 Arc::new(provider),
//!                 ProviderProfile::new("gpt-4o-mini").max_connections(8),
//!             )
//!             .build()?,
//!     );
//!     orchestrator.start().await;
//!
//!     let response = orchestrator
//!         .handle_turn(&[Message::user("hello there")], PriorityClass::Normal)
//!         .await?;
//!     println!("[{}] {}", response.source, response.text);
//!
//!     orchestrator.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod pool;
pub mod prediction;
pub mod providers;
pub mod stats;
pub mod stream;
pub mod telemetry;
pub mod template;
pub mod traits;
pub mod types;
pub mod version;

pub use cache::{
    CacheConfig, CacheStats, CachedResponse, InMemoryStore, PersistentStore,
    PreGeneratedCandidate, TieredCache,
};
pub use config::Config;
pub use dispatch::{DispatchStats, DispatcherConfig, ParallelDispatcher};
pub use error::{HuginnError, ProviderFailure, Result};
pub use fingerprint::Fingerprint;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pool::{ConnectionHandle, PoolManager, PoolStats, ProviderProfile};
pub use prediction::{Prediction, PredictionConfig, PredictionEngine, PredictionStats};
pub use providers::{
    Completion, CompletionRequest, FragmentStream, HttpProvider, RetryConfig, UpstreamConnection,
    UpstreamProvider,
};
pub use stats::StatsSnapshot;
pub use stream::{StreamConfig, StreamOptimizer, StreamStats};
pub use template::{TemplateMatch, TemplateMatcher};
pub use traits::{CollectingSink, ResponseValidator, TransportSink};
pub use types::{
    Message, ModelTarget, OutputKind, OutputUnit, PriorityClass, ProcessingRequest, Role,
    SourceTag, TurnResponse, Validation,
};
