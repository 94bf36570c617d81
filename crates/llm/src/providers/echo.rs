//! Offline provider that answers without a model.
//!
//! The echo client replies with the question found at the end of the prompt,
//! streamed word by word. It lets the CLI and tests run without a network.

use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk, LlmUsage};
use futures::StreamExt;
use repowiki_core::AppResult;
use std::time::Duration;

/// Deterministic offline LLM client.
#[derive(Debug, Clone, Default)]
pub struct EchoClient {
    /// Pause between streamed fragments
    delay: Option<Duration>,
}

impl EchoClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between fragments, to emulate a slow model.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    /// Build the reply for a prompt.
    fn reply(request: &LlmRequest) -> String {
        let last_line = request
            .prompt
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("");

        format!("[{}] {}", request.model, last_line)
    }
}

#[async_trait::async_trait]
impl LlmClient for EchoClient {
    fn provider_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        let content = Self::reply(request);
        let usage = LlmUsage::new(
            request.prompt.split_whitespace().count() as u32,
            content.split_whitespace().count() as u32,
        );

        Ok(LlmResponse {
            content,
            model: request.model.clone(),
            usage,
        })
    }

    async fn stream(&self, request: &LlmRequest) -> AppResult<LlmStream> {
        let model = request.model.clone();
        let reply = Self::reply(request);

        let mut chunks: Vec<LlmStreamChunk> = reply
            .split_inclusive(' ')
            .map(|word| LlmStreamChunk::fragment(word, model.clone()))
            .collect();
        chunks.push(LlmStreamChunk::finished(model, None));

        let delay = self.delay;
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        });

        Ok(Box::pin(stream))
    }
}
