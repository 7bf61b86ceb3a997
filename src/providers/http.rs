//! OpenAI-compatible chat completions over HTTP.
//!
//! Works with any service exposing `POST {base_url}/chat/completions` in the
//! OpenAI wire format, including local servers (vLLM, llama.cpp, Ollama's
//! `/v1` endpoint). Streaming uses server-sent events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use super::backpressure::DEFAULT_FRAGMENT_BUFFER;
use super::traits::{
    Completion, CompletionRequest, FragmentStream, UpstreamConnection, UpstreamProvider,
};
use crate::pool::ProviderProfile;
use crate::types::Message;
use crate::{HuginnError, Result};

/// Provider for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpProvider {
    /// Create a provider. `timeout` bounds each HTTP request.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HuginnError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            http,
        })
    }

    /// Create a provider from its configuration section.
    ///
    /// The profile must name a `base_url`. When it names an `api_key_env`,
    /// that environment variable must be set.
    pub fn from_profile(name: &str, profile: &ProviderProfile) -> Result<Self> {
        let base_url = profile.base_url.as_deref().ok_or_else(|| {
            HuginnError::Configuration(format!("provider '{name}' has no base_url"))
        })?;
        let api_key = match &profile.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                HuginnError::Configuration(format!(
                    "provider '{name}': environment variable {var} is not set"
                ))
            })?),
            None => None,
        };
        Self::new(name, base_url, api_key, profile.timeout)
    }
}

#[async_trait]
impl UpstreamProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, model: &str) -> Result<Arc<dyn UpstreamConnection>> {
        Ok(Arc::new(HttpConnection {
            provider: self.clone(),
            model: model.to_owned(),
        }))
    }
}

/// A logical connection; reqwest keeps the TCP connections alive underneath.
struct HttpConnection {
    provider: HttpProvider,
    model: String,
}

impl HttpConnection {
    async fn post(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let mut builder = self
            .provider
            .http
            .post(format!("{}/chat/completions", self.provider.base_url))
            .json(&body);
        if let Some(key) = &self.provider.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| self.failure(e.to_string(), None, None))?;
        self.check_status(response).await
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        Err(self.failure(message, Some(status.as_u16()), retry_after))
    }

    fn failure(
        &self,
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    ) -> HuginnError {
        HuginnError::UpstreamFailure {
            provider: self.provider.name.clone(),
            model: self.model.clone(),
            message,
            status,
            retry_after,
        }
    }
}

#[async_trait]
impl UpstreamConnection for HttpConnection {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let response = self.post(request, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid response body: {e}"), None, None))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.failure("response has no choices".into(), None, None))?;
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            finish_reason: choice.finish_reason,
        })
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let response = self.post(request, true).await?;
        let mut bytes = response.bytes_stream();
        let (tx, rx) = tokio::sync::mpsc::channel(DEFAULT_FRAGMENT_BUFFER);
        let provider = self.provider.name.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(HuginnError::upstream(&provider, &model, e.to_string())))
                            .await;
                        return;
                    }
                };
                lines.extend(&chunk);
                while let Some(line) = lines.next_line() {
                    match parse_sse_line(line.trim()) {
                        SseLine::Fragment(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn ping(&self) -> Result<()> {
        let mut builder = self
            .provider
            .http
            .get(format!("{}/models", self.provider.base_url));
        if let Some(key) = &self.provider.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| self.failure(e.to_string(), None, None))?;
        self.check_status(response).await.map(|_| ())
    }
}

/// Byte buffer for the SSE body. Lines are decoded only once complete, so a
/// multi-byte character split across network chunks stays intact.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|t| !t.is_empty())
            .map_or(SseLine::Skip, SseLine::Fragment),
        Err(_) => SseLine::Skip,
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}
