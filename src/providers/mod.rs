//! Upstream provider plumbing.
//!
//! Providers are reached only through the connection pool. This module holds
//! the provider/connection traits, the HTTP implementation, and the helpers
//! the dispatcher wraps around upstream calls (retry, latency tracking,
//! streaming backpressure).

pub mod backpressure;
pub mod http;
pub mod latency;
pub mod retry;
pub mod traits;

pub use backpressure::{DEFAULT_FRAGMENT_BUFFER, bounded_stream, bounded_stream_with};
pub use http::HttpProvider;
pub use latency::{LatencyBoard, ProviderLatency};
pub use retry::RetryConfig;
pub use traits::{
    Completion, CompletionRequest, FragmentStream, UpstreamConnection, UpstreamProvider,
};
