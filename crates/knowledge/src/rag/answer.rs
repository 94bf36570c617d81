//! Answer orchestration: prompt assembly, streamed generation, turn recording.
//!
//! Generation runs in a spawned producer task that relays fragments over a
//! bounded channel. The consumer side, [`AnswerStream`], records a turn only
//! when the provider finished normally. Cancelling the stream (or dropping
//! it) signals the provider through a [`CancellationToken`] and abandons the
//! producer after a grace period.

use crate::conversation::SharedConversation;
use crate::rag::types::{Answer, AnswerEvent};
use crate::types::{Provenance, ScoredUnit, Turn};
use futures::{ready, Stream, StreamExt};
use repowiki_core::{AppError, AppResult};
use repowiki_llm::{LlmClient, LlmRequest};
use repowiki_prompt::{build_prompt, AnswerContext, PromptDefinition, PromptSource, PromptTurn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 32;

/// What the producer task sends to the consumer.
#[derive(Debug)]
enum Relay {
    Fragment(String),
    Done,
    Failed(AppError),
}

/// Builds answer prompts and runs generation for them.
#[derive(Clone)]
pub struct AnswerOrchestrator {
    client: Arc<dyn LlmClient>,
    prompt: PromptDefinition,
    model: String,
    generation_timeout: Duration,
    cancel_grace: Duration,
}

impl AnswerOrchestrator {
    pub fn new(client: Arc<dyn LlmClient>, prompt: PromptDefinition, model: impl Into<String>) -> Self {
        Self {
            client,
            prompt,
            model: model.into(),
            generation_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_millis(500),
        }
    }

    pub fn with_timeouts(mut self, generation_timeout: Duration, cancel_grace: Duration) -> Self {
        self.generation_timeout = generation_timeout;
        self.cancel_grace = cancel_grace;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.client.provider_name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Render the answer prompt into a streaming LLM request.
    pub fn build_request(
        &self,
        repository: &str,
        query: &str,
        retrieved: &[ScoredUnit],
        history: &[Turn],
    ) -> AppResult<LlmRequest> {
        let context = AnswerContext {
            repository: repository.to_string(),
            question: query.to_string(),
            history: history
                .iter()
                .map(|turn| PromptTurn {
                    question: turn.query.clone(),
                    answer: turn.answer.clone(),
                })
                .collect(),
            sources: retrieved
                .iter()
                .map(|scored| {
                    PromptSource::new(
                        scored.unit.path.clone(),
                        scored.unit.start_line,
                        scored.unit.end_line,
                        scored.unit.text.clone(),
                    )
                })
                .collect(),
        };

        let built = build_prompt(&self.prompt, &context)?;
        debug!(
            "Built prompt '{}' with {} sources and {} history turns",
            built.metadata.source_prompt_id, built.metadata.source_count, built.metadata.history_turns
        );

        let mut request = LlmRequest::new(built.user, self.model.clone()).with_streaming();
        if let Some(system) = built.system {
            request = request.with_system(system);
        }
        if let Some(temperature) = built.metadata.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = built.metadata.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        Ok(request)
    }

    /// Start answering `query`.
    ///
    /// Fragments are relayed as the provider produces them. When the provider
    /// finishes, a [`Turn`] with the full answer is appended to
    /// `conversation`. Errors, timeouts and cancellation append nothing.
    /// Must be called from within a Tokio runtime.
    pub fn answer(
        &self,
        repository: &str,
        query: &str,
        retrieved: &[ScoredUnit],
        history: &[Turn],
        conversation: SharedConversation,
    ) -> AppResult<AnswerStream> {
        let request = self.build_request(repository, query, retrieved, history)?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        info!(
            "Generating answer with {}/{} ({} sources)",
            self.client.provider_name(),
            self.model,
            retrieved.len()
        );

        let producer = tokio::spawn(produce(
            self.client.clone(),
            request,
            tx,
            cancel.clone(),
            self.generation_timeout,
        ));

        Ok(AnswerStream {
            receiver: rx,
            query: query.to_string(),
            accumulated: String::new(),
            provenance: retrieved.iter().map(Provenance::from).collect(),
            conversation,
            cancel,
            producer: Some(producer),
            grace: self.cancel_grace,
            completed: false,
            finished: false,
        })
    }
}

/// Drive one generation and relay it into `tx`.
async fn produce(
    client: Arc<dyn LlmClient>,
    request: LlmRequest,
    tx: mpsc::Sender<Relay>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let relay = async {
        let mut stream = client.stream_cancellable(&request, cancel.clone()).await?;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() && tx.send(Relay::Fragment(chunk.content)).await.is_err() {
                // Consumer went away
                return Ok(false);
            }
            if chunk.done {
                return Ok(true);
            }
        }

        if cancel.is_cancelled() {
            return Ok(false);
        }
        // Only a final chunk marks completion; a stream that just ends was truncated
        Err::<bool, AppError>(AppError::Generation(
            "stream ended before completion".to_string(),
        ))
    };

    let outcome = match tokio::time::timeout(timeout, relay).await {
        Ok(Ok(true)) => Relay::Done,
        Ok(Ok(false)) | Ok(Err(AppError::Cancelled)) => {
            debug!("Generation stopped before completion");
            return;
        }
        Ok(Err(e @ AppError::Generation(_))) => {
            warn!("Generation failed: {}", e);
            Relay::Failed(e)
        }
        Ok(Err(e)) => {
            warn!("Generation failed: {}", e);
            Relay::Failed(AppError::Generation(e.to_string()))
        }
        Err(_) => {
            warn!("Generation timed out after {:?}", timeout);
            Relay::Failed(AppError::Generation(format!(
                "no complete answer within {:?}",
                timeout
            )))
        }
    };

    // The consumer may already be gone
    let _ = tx.send(outcome).await;
}

/// A streamed answer.
///
/// Yields `Ok(AnswerEvent::Fragment)` items, then ends. A failed generation
/// ends with one `Err(AppError::Generation)` item. The stream is not
/// restartable; asking again starts a new generation.
pub struct AnswerStream {
    receiver: mpsc::Receiver<Relay>,
    query: String,
    accumulated: String,
    provenance: Vec<Provenance>,
    conversation: SharedConversation,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    grace: Duration,
    completed: bool,
    finished: bool,
}

impl AnswerStream {
    /// Retrieved excerpts the answer is grounded on, in rank order.
    pub fn provenance(&self) -> &[Provenance] {
        &self.provenance
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    /// Whether the provider finished and the turn was recorded.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Token that cancels this answer when fired from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop relaying, signal the provider and discard the partial answer.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }

        info!("Answer cancelled after {} bytes", self.accumulated.len());
        self.finished = true;
        self.cancel.cancel();
        self.receiver.close();
        self.abandon_producer();
    }

    /// Collect the whole answer. Fails if generation fails or the answer
    /// is cancelled from elsewhere.
    pub async fn into_answer(mut self) -> AppResult<Answer> {
        while let Some(event) = self.next().await {
            event?;
        }

        if !self.completed {
            return Err(AppError::Cancelled);
        }

        Ok(Answer {
            question: std::mem::take(&mut self.query),
            answer: std::mem::take(&mut self.accumulated),
            provenance: std::mem::take(&mut self.provenance),
        })
    }

    fn record_turn(&mut self) {
        let turn = Turn::new(self.query.clone(), self.accumulated.clone());
        let mut conversation = self
            .conversation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversation.append(turn);
        debug!("Recorded turn {}", conversation.len());
    }

    /// Give the producer `grace` to wind down, then abort it.
    fn abandon_producer(&mut self) {
        let Some(mut producer) = self.producer.take() else {
            return;
        };

        if producer.is_finished() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let grace = self.grace;
                runtime.spawn(async move {
                    tokio::select! {
                        _ = &mut producer => {}
                        _ = tokio::time::sleep(grace) => {
                            warn!("Provider did not stop within {:?}; abandoning it", grace);
                            producer.abort();
                        }
                    }
                });
            }
            Err(_) => producer.abort(),
        }
    }
}

impl Stream for AnswerStream {
    type Item = AppResult<AnswerEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let relay = ready!(self.receiver.poll_recv(cx));
        match relay {
            Some(Relay::Fragment(text)) => {
                self.accumulated.push_str(&text);
                Poll::Ready(Some(Ok(AnswerEvent::Fragment(text))))
            }
            Some(Relay::Done) => {
                self.finished = true;
                self.completed = true;
                self.record_turn();
                Poll::Ready(None)
            }
            Some(Relay::Failed(e)) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationState;
    use crate::types::Unit;
    use async_trait::async_trait;
    use repowiki_llm::{EchoClient, LlmResponse, LlmStream, LlmStreamChunk};
    use repowiki_prompt::builtin_answer_prompt;
    use std::sync::RwLock;

    /// Streams fixed fragments, then fails, hangs or just ends.
    struct ScriptedClient {
        fragments: Vec<&'static str>,
        then: Ending,
    }

    #[derive(Clone, Copy)]
    enum Ending {
        Fail,
        Hang,
        Close,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: &LlmRequest) -> AppResult<LlmResponse> {
            Err(AppError::Llm("not used".to_string()))
        }

        async fn stream(&self, request: &LlmRequest) -> AppResult<LlmStream> {
            let model = request.model.clone();
            let head = futures::stream::iter(
                self.fragments
                    .iter()
                    .map(move |f| Ok::<_, AppError>(LlmStreamChunk::fragment(*f, model.clone())))
                    .collect::<Vec<_>>(),
            );

            let tail: LlmStream = match self.then {
                Ending::Fail => Box::pin(futures::stream::iter(vec![Err(AppError::Llm(
                    "connection reset".to_string(),
                ))])),
                Ending::Hang => Box::pin(futures::stream::pending()),
                Ending::Close => Box::pin(futures::stream::empty()),
            };

            Ok(Box::pin(head.chain(tail)))
        }
    }

    fn conversation() -> SharedConversation {
        Arc::new(RwLock::new(ConversationState::new()))
    }

    fn scored(path: &str, text: &str, score: f32) -> ScoredUnit {
        ScoredUnit {
            unit: Unit {
                path: path.to_string(),
                start_line: 1,
                end_line: 3,
                text: text.to_string(),
                hash: String::new(),
            },
            score,
            ordinal: 0,
        }
    }

    fn orchestrator(client: Arc<dyn LlmClient>) -> AnswerOrchestrator {
        AnswerOrchestrator::new(client, builtin_answer_prompt().unwrap(), "test-model")
            .with_timeouts(Duration::from_secs(5), Duration::from_millis(50))
    }

    #[test]
    fn test_request_contains_tagged_sources_and_history() {
        let orchestrator = orchestrator(Arc::new(EchoClient::new()));
        let history = vec![Turn::new("what is foo?", "foo is a helper")];
        let retrieved = vec![scored("pkg/b.py", "def beta(): pass", 0.9)];

        let request = orchestrator
            .build_request("acme_repo", "who calls beta?", &retrieved, &history)
            .unwrap();

        assert!(request.stream);
        assert!(request.prompt.contains("[pkg/b.py:1-3]"));
        assert!(request.prompt.contains("def beta(): pass"));
        assert!(request.prompt.contains("what is foo?"));
        assert!(request.prompt.trim_end().ends_with("Question: who calls beta?"));
        assert!(request.system.unwrap().contains("acme_repo"));
    }

    #[tokio::test]
    async fn test_completed_answer_records_turn() {
        let conversation = conversation();
        let orchestrator = orchestrator(Arc::new(EchoClient::new()));
        let retrieved = vec![scored("a.py", "x = 1", 0.5)];

        let mut stream = orchestrator
            .answer("repo", "what is x?", &retrieved, &[], conversation.clone())
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(event) = stream.next().await {
            let AnswerEvent::Fragment(text) = event.unwrap();
            fragments.push(text);
        }

        assert!(fragments.len() > 1);
        assert!(stream.is_completed());
        assert_eq!(stream.provenance()[0].path, "a.py");

        let turns = conversation.read().unwrap().turns().to_vec();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].query, "what is x?");
        assert_eq!(turns[0].answer, fragments.concat());
        assert!(turns[0].answer.ends_with("what is x?"));
    }

    #[tokio::test]
    async fn test_into_answer() {
        let conversation = conversation();
        let orchestrator = orchestrator(Arc::new(EchoClient::new()));

        let answer = orchestrator
            .answer("repo", "how?", &[], &[], conversation.clone())
            .unwrap()
            .into_answer()
            .await
            .unwrap();

        assert_eq!(answer.answer, "[test-model] Question: how?");
        assert!(answer.provenance.is_empty());
        assert_eq!(conversation.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_records_nothing() {
        let conversation = conversation();
        let client = Arc::new(EchoClient::with_delay(Duration::from_millis(20)));
        let orchestrator = orchestrator(client);

        let mut stream = orchestrator
            .answer("repo", "a question with several words", &[], &[], conversation.clone())
            .unwrap();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        stream.cancel();

        assert!(stream.next().await.is_none());
        assert!(!stream.is_completed());

        // Give the producer time to finish anyway
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(conversation.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_records_nothing() {
        let conversation = conversation();
        let client = Arc::new(EchoClient::with_delay(Duration::from_millis(20)));
        let orchestrator = orchestrator(client);

        let mut stream = orchestrator
            .answer("repo", "dropped early", &[], &[], conversation.clone())
            .unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conversation.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_ends_with_generation_error() {
        let conversation = conversation();
        let client = Arc::new(ScriptedClient {
            fragments: vec!["partial ", "answer"],
            then: Ending::Fail,
        });

        let mut stream = orchestrator(client)
            .answer("repo", "q", &[], &[], conversation.clone())
            .unwrap();

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(AppError::Generation(_))));
        assert!(conversation.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_timeout_is_generation_error() {
        let conversation = conversation();
        let client = Arc::new(ScriptedClient {
            fragments: vec!["thinking"],
            then: Ending::Hang,
        });
        let orchestrator = AnswerOrchestrator::new(client, builtin_answer_prompt().unwrap(), "m")
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(50));

        let result = orchestrator
            .answer("repo", "q", &[], &[], conversation.clone())
            .unwrap()
            .into_answer()
            .await;

        assert!(matches!(result, Err(AppError::Generation(_))));
        assert!(conversation.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_closed_without_final_chunk_is_not_a_turn() {
        let conversation = conversation();
        let client = Arc::new(ScriptedClient {
            fragments: vec!["The answer is"],
            then: Ending::Close,
        });

        let mut stream = orchestrator(client)
            .answer("repo", "q", &[], &[], conversation.clone())
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, AnswerEvent::Fragment("The answer is".to_string()));
        assert!(matches!(stream.next().await, Some(Err(AppError::Generation(_)))));
        assert!(stream.next().await.is_none());
        assert!(!stream.is_completed());
        assert!(conversation.read().unwrap().is_empty());
    }
}
