//! Cancelling a streamed answer.

use super::{fs_source, open_kb_with_client, write_repo, TestProvider};
use crate::config::{KnowledgeBaseConfig, PathFilters};
use crate::rag::AnswerEvent;
use async_trait::async_trait;
use futures::StreamExt;
use repowiki_core::{AppError, AppResult};
use repowiki_llm::{EchoClient, LlmClient, LlmRequest, LlmResponse, LlmStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_cancelled_answer_records_no_turn() {
    let repo = write_repo(&[("lib.rs", "pub fn shutdown_server() {\n    drain();\n}\n")]);
    let workspace = TempDir::new().unwrap();
    let kb = open_kb_with_client(
        workspace.path(),
        KnowledgeBaseConfig::default(),
        Arc::new(TestProvider::new(64)),
        Arc::new(EchoClient::with_delay(Duration::from_millis(20))),
    );
    kb.build(fs_source(repo.path()), PathFilters::new())
        .await
        .unwrap();

    let mut stream = kb.query("how does shutdown_server drain connections?").await.unwrap();
    assert_eq!(stream.provenance()[0].path, "lib.rs");

    let first = stream.next().await.unwrap().unwrap();
    assert!(matches!(first, AnswerEvent::Fragment(_)));
    assert!(!stream.text().is_empty());

    stream.cancel();
    assert!(stream.next().await.is_none());
    assert!(!stream.is_completed());
    assert!(kb.history().is_empty());

    // The next question runs normally
    let answer = kb.ask("what does drain do?").await.unwrap();
    assert_eq!(kb.history().len(), 1);
    assert_eq!(kb.history()[0].answer, answer.answer);
}

#[tokio::test]
async fn test_cancel_from_token_ends_collection() {
    let repo = write_repo(&[("lib.rs", "pub fn start() {}\n")]);
    let workspace = TempDir::new().unwrap();
    let kb = open_kb_with_client(
        workspace.path(),
        KnowledgeBaseConfig::default(),
        Arc::new(TestProvider::new(64)),
        Arc::new(EchoClient::with_delay(Duration::from_millis(50))),
    );
    kb.build(fs_source(repo.path()), PathFilters::new())
        .await
        .unwrap();

    let stream = kb.query("what does start do?").await.unwrap();
    let token = stream.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
    });

    let result = stream.into_answer().await;
    assert!(matches!(result, Err(AppError::Cancelled)));
    assert!(kb.history().is_empty());
}

/// Echoes answers and keeps every prompt it was sent.
#[derive(Default)]
struct RecordingClient {
    echo: EchoClient,
    prompts: Mutex<Vec<String>>,
}

impl RecordingClient {
    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for RecordingClient {
    fn provider_name(&self) -> &str {
        "recording"
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.echo.complete(request).await
    }

    async fn stream(&self, request: &LlmRequest) -> AppResult<LlmStream> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.echo.stream(request).await
    }
}

#[tokio::test]
async fn test_history_feeds_the_next_prompt() {
    let repo = write_repo(&[("lib.rs", "pub fn start() {}\n")]);
    let workspace = TempDir::new().unwrap();
    let client = Arc::new(RecordingClient::default());
    let kb = open_kb_with_client(
        workspace.path(),
        KnowledgeBaseConfig::default(),
        Arc::new(TestProvider::new(64)),
        client.clone(),
    );
    kb.build(fs_source(repo.path()), PathFilters::new())
        .await
        .unwrap();

    kb.ask("first question").await.unwrap();
    kb.ask("second question").await.unwrap();

    let history = kb.history();
    let queries: Vec<_> = history.iter().map(|t| t.query.as_str()).collect();
    assert_eq!(queries, vec!["first question", "second question"]);

    let prompts = client.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("conversation_history"));
    assert!(prompts[1].contains("first question"));
    assert!(prompts[1].contains(&history[0].answer));

    kb.clear_conversation();
    assert_eq!(kb.stats().conversation_turns, 0);
}
