//! Scenario tests that drive a whole knowledge base.

mod cancellation;
mod ranking;

use crate::config::KnowledgeBaseConfig;
use crate::embeddings::providers::TrigramProvider;
use crate::embeddings::EmbeddingProvider;
use crate::knowledge_base::KnowledgeBase;
use crate::rag::AnswerOrchestrator;
use crate::source::{FsRepositorySource, RepositorySource};
use async_trait::async_trait;
use repowiki_core::{AppError, AppResult};
use repowiki_llm::{EchoClient, LlmClient};
use repowiki_prompt::builtin_answer_prompt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Texts containing this marker fail to embed.
pub(crate) const BROKEN_MARKER: &str = "BROKEN";

/// Trigram embeddings with a call counter, optional latency and failures.
#[derive(Debug)]
pub(crate) struct TestProvider {
    inner: TrigramProvider,
    calls: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl TestProvider {
    pub(crate) fn new(dimensions: usize) -> Self {
        Self {
            inner: TrigramProvider::new(dimensions),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Texts embedded so far.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for TestProvider {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) || texts.iter().any(|t| t.contains(BROKEN_MARKER)) {
            return Err(AppError::Embedding("embedding service unavailable".to_string()));
        }

        self.inner.embed_batch(texts).await
    }
}

/// A repository on disk with the given files.
pub(crate) fn write_repo(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for (relative, contents) in files {
        let path = temp.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    temp
}

pub(crate) fn fs_source(root: &Path) -> Arc<dyn RepositorySource> {
    Arc::new(FsRepositorySource::new(root).unwrap())
}

pub(crate) fn open_kb(
    workspace: &Path,
    config: KnowledgeBaseConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> KnowledgeBase {
    open_kb_with_client(workspace, config, embedder, Arc::new(EchoClient::new()))
}

pub(crate) fn open_kb_with_client(
    workspace: &Path,
    config: KnowledgeBaseConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    client: Arc<dyn LlmClient>,
) -> KnowledgeBase {
    let orchestrator =
        AnswerOrchestrator::new(client, builtin_answer_prompt().unwrap(), "echo-model");
    KnowledgeBase::open(workspace, "demo", config, embedder, orchestrator).unwrap()
}
