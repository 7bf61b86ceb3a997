//! Mock upstream providers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use huginn::providers::{Completion, CompletionRequest, FragmentStream};
use huginn::{HuginnError, Result, UpstreamConnection, UpstreamProvider};

/// How a scripted provider answers.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with the text after `delay`.
    Reply(&'static str, Duration),
    /// Fail with an HTTP-like status after `delay`.
    Fail(u16, Duration),
    /// Stream the fragments, pausing `gap` before each.
    Fragments(Vec<&'static str>, Duration),
}

/// Provider whose every connection follows one script.
pub struct ScriptedProvider {
    name: &'static str,
    script: Script,
    connects: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            script,
            connects: AtomicUsize::new(0),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn replying(name: &'static str, text: &'static str) -> Arc<Self> {
        Self::new(name, Script::Reply(text, Duration::ZERO))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn connect(&self, _model: &str) -> Result<Arc<dyn UpstreamConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedConnection {
            provider: self.name,
            script: self.script.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct ScriptedConnection {
    provider: &'static str,
    script: Script,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl UpstreamConnection for ScriptedConnection {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Reply(text, delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Completion::new(*text, &request.model))
            }
            Script::Fail(status, delay) => {
                tokio::time::sleep(*delay).await;
                Err(HuginnError::UpstreamFailure {
                    provider: self.provider.into(),
                    model: request.model.clone(),
                    message: format!("HTTP {status}"),
                    status: Some(*status),
                    retry_after: None,
                })
            }
            Script::Fragments(fragments, _) => {
                Ok(Completion::new(fragments.concat(), &request.model))
            }
        }
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let Script::Fragments(fragments, gap) = &self.script else {
            let completion = self.complete(request).await?;
            return Ok(Box::pin(futures_util::stream::once(async move {
                Ok(completion.text)
            })));
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gap = *gap;
        let fragments: Vec<String> = fragments.iter().map(|f| (*f).to_owned()).collect();
        Ok(Box::pin(futures_util::stream::unfold(
            fragments.into_iter(),
            move |mut rest| async move {
                let next = rest.next()?;
                tokio::time::sleep(gap).await;
                Some((Ok(next), rest))
            },
        )))
    }
}
