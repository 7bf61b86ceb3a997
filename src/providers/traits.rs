//! Upstream provider traits.
//!
//! A provider is a factory for connections; a connection is the handle a
//! pool hands out and the only way to reach the upstream. Splitting the two
//! lets the pool own connection lifetime (rotation, error eviction,
//! keep-alive) while providers stay stateless.
//!
//! # Example
//!
//! ```ignore
//! #[async_trait]
//! impl UpstreamConnection for EchoConnection {
//!     async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
//!         let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
//!         Ok(Completion::new(last, &request.model))
//!     }
//! }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::Result;
use crate::types::Message;

/// Fragments of a streamed completion.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub finish_reason: Option<String>,
}

impl Completion {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            finish_reason: None,
        }
    }
}

/// Creates connections to one upstream service.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Provider name, matching its configuration key.
    fn name(&self) -> &str;

    /// Open a connection for `model`.
    async fn connect(&self, model: &str) -> Result<Arc<dyn UpstreamConnection>>;
}

/// A reusable handle to an upstream model.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Stream a completion as text fragments.
    ///
    /// Default implementation yields the whole completion as one fragment.
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let completion = self.complete(request).await?;
        Ok(Box::pin(futures_util::stream::once(async move {
            Ok(completion.text)
        })))
    }

    /// Cheap liveness probe used by keep-alive maintenance.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
