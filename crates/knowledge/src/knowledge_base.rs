//! The knowledge base: one repository's index, conversation and lifecycle.
//!
//! ```text
//! Uninitialized ──build──▶ Building ──▶ Ready ──build──▶ Rebuilding ──▶ Ready
//!        load mismatch ──▶ Stale ──rebuild──▶ Building
//! ```
//!
//! Queries are answered only in `Ready`. Builds run in a spawned task; every
//! build request made while one is running awaits that same task.

use crate::chunker;
use crate::config::{self, KnowledgeBaseConfig, PathFilters};
use crate::conversation::{ConversationState, SharedConversation};
use crate::embeddings::{create_provider, EmbeddingConfig, EmbeddingProvider};
use crate::guard;
use crate::index::{self, BuildOptions, EmbeddingIndex};
use crate::progress::ProgressReporter;
use crate::rag::{Answer, AnswerOrchestrator, AnswerStream};
use crate::retriever::{self, RetrievalFilters};
use crate::source::RepositorySource;
use crate::store;
use crate::types::{BuildSummary, KnowledgeBaseStats, RetrievalResult, Turn, Unit};
use futures::future::{BoxFuture, FutureExt, Shared};
use repowiki_core::{AppConfig, AppError, AppResult, SchemaMismatch};
use repowiki_llm::create_client_from_config;
use repowiki_prompt::{resolve_prompt, DEFAULT_ANSWER_PROMPT_ID};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

type PendingBuild = Shared<BoxFuture<'static, AppResult<BuildSummary>>>;

/// Lifecycle state of a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No index has been built or loaded
    Uninitialized,
    /// First build in progress
    Building,
    /// Index loaded; queries are accepted
    Ready,
    /// Replacing a loaded index
    Rebuilding,
    /// The stored index was built under an incompatible version
    Stale,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Building => "building",
            LifecycleState::Ready => "ready",
            LifecycleState::Rebuilding => "rebuilding",
            LifecycleState::Stale => "stale",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum State {
    Uninitialized,
    Building,
    Ready(Arc<EmbeddingIndex>),
    /// Holds the index being replaced
    Rebuilding(Arc<EmbeddingIndex>),
    Stale(SchemaMismatch),
}

impl State {
    fn lifecycle(&self) -> LifecycleState {
        match self {
            State::Uninitialized => LifecycleState::Uninitialized,
            State::Building => LifecycleState::Building,
            State::Ready(_) => LifecycleState::Ready,
            State::Rebuilding(_) => LifecycleState::Rebuilding,
            State::Stale(_) => LifecycleState::Stale,
        }
    }
}

struct Inner {
    workspace: PathBuf,
    repository: String,
    config: KnowledgeBaseConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    orchestrator: AnswerOrchestrator,
    conversation: SharedConversation,
    state: RwLock<State>,
    pending: Mutex<Option<PendingBuild>>,
    progress: Mutex<ProgressReporter>,
}

/// A repository's knowledge base.
///
/// Cheap to clone; clones share the index, conversation and build gate.
#[derive(Clone)]
pub struct KnowledgeBase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("repository", &self.inner.repository)
            .field("state", &self.state())
            .field("embedder", &self.inner.embedder)
            .finish()
    }
}

impl KnowledgeBase {
    /// Open the knowledge base for `repository` in `workspace`.
    ///
    /// A compatible stored index is loaded (`Ready`). No store leaves the
    /// base `Uninitialized`; a store built under another version leaves it
    /// `Stale` until [`rebuild`](Self::rebuild) is called.
    pub fn open(
        workspace: &Path,
        repository: &str,
        config: KnowledgeBaseConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        orchestrator: AnswerOrchestrator,
    ) -> AppResult<Self> {
        config.validate()?;

        let orchestrator =
            orchestrator.with_timeouts(config.generation_timeout(), config.cancel_grace());

        let kb = Self {
            inner: Arc::new(Inner {
                workspace: workspace.to_path_buf(),
                repository: repository.to_string(),
                config,
                embedder,
                orchestrator,
                conversation: Arc::new(RwLock::new(ConversationState::new())),
                state: RwLock::new(State::Uninitialized),
                pending: Mutex::new(None),
                progress: Mutex::new(ProgressReporter::noop()),
            }),
        };

        kb.load()?;
        Ok(kb)
    }

    /// Open using application settings: the base's own config file when it
    /// exists, otherwise the embedding provider chosen in `app`.
    pub fn open_with_app_config(app: &AppConfig, repository: &str) -> AppResult<Self> {
        let workspace = app.workspace.as_path();
        let mut config = config::load_config(workspace, repository)?;

        if !config::get_config_path(workspace, repository).exists() {
            let mut embedding =
                EmbeddingConfig::for_provider(&app.embedding_provider, &app.embedding_model);
            embedding.endpoint = app.provider_endpoint(&app.embedding_provider);
            config.embedding = embedding;
        }

        let api_key = app.resolve_api_key(&config.embedding.provider);
        let embedder = create_provider(&config.embedding, api_key.as_deref())?;

        let client = create_client_from_config(app)?;
        let prompt = resolve_prompt(workspace, DEFAULT_ANSWER_PROMPT_ID)?;
        let orchestrator = AnswerOrchestrator::new(client, prompt, app.model.clone());

        Self::open(workspace, repository, config, embedder, orchestrator)
    }

    /// Report build progress through `reporter` from now on.
    pub fn set_progress(&self, reporter: ProgressReporter) {
        *lock(&self.inner.progress) = reporter;
    }

    pub fn repository(&self) -> &str {
        &self.inner.repository
    }

    pub fn config(&self) -> &KnowledgeBaseConfig {
        &self.inner.config
    }

    pub fn index_path(&self) -> PathBuf {
        config::get_index_path(&self.inner.workspace, &self.inner.repository)
    }

    pub fn state(&self) -> LifecycleState {
        self.read_state().lifecycle()
    }

    /// The version mismatch that made the base `Stale`.
    pub fn stale_reason(&self) -> Option<SchemaMismatch> {
        match &*self.read_state() {
            State::Stale(mismatch) => Some(mismatch.clone()),
            _ => None,
        }
    }

    /// Re-read the stored index from disk.
    ///
    /// Ignored while a build is running; the build's result replaces
    /// whatever is loaded.
    pub fn load(&self) -> AppResult<LifecycleState> {
        let path = self.index_path();
        let expected = guard::expected_version(self.inner.embedder.as_ref());

        let loaded = match store::load(&path, &expected) {
            Ok(index) => {
                info!(
                    "Loaded index for '{}' ({} units, {})",
                    self.inner.repository,
                    index.len(),
                    index.version()
                );
                State::Ready(Arc::new(index))
            }
            Err(AppError::NotReady(_)) => {
                debug!("No stored index for '{}'", self.inner.repository);
                State::Uninitialized
            }
            Err(AppError::SchemaMismatch(mismatch)) => {
                warn!(
                    "Stored index for '{}' is stale: {}",
                    self.inner.repository, mismatch
                );
                State::Stale(*mismatch)
            }
            Err(AppError::Storage(e)) => {
                warn!(
                    "Stored index for '{}' is unreadable, treating as absent: {}",
                    self.inner.repository, e
                );
                State::Uninitialized
            }
            Err(e) => return Err(e),
        };

        let mut state = self.write_state();
        if matches!(*state, State::Building | State::Rebuilding(_)) {
            debug!("Build in progress, keeping current state");
            return Ok(state.lifecycle());
        }
        *state = loaded;
        Ok(state.lifecycle())
    }

    /// Build the index from `source`, reusing vectors of unchanged units
    /// when a compatible index is loaded. Refused while `Stale`.
    pub async fn build(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
    ) -> AppResult<BuildSummary> {
        self.start_build(source, filters, false).await
    }

    /// Build from scratch, re-embedding every unit. The only way out of `Stale`.
    pub async fn rebuild(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
    ) -> AppResult<BuildSummary> {
        self.start_build(source, filters, true).await
    }

    /// Make the base queryable: keep a loaded index, otherwise build.
    ///
    /// Returns the summary when a build ran. A stale store is reported as
    /// [`AppError::SchemaMismatch`] rather than rebuilt silently.
    pub async fn ensure_ready(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
    ) -> AppResult<Option<BuildSummary>> {
        let current = self.read_state().clone();
        match current {
            State::Ready(_) => Ok(None),
            State::Stale(mismatch) => Err(mismatch.into()),
            State::Uninitialized | State::Building | State::Rebuilding(_) => {
                self.build(source, filters).await.map(Some)
            }
        }
    }

    async fn start_build(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
        force: bool,
    ) -> AppResult<BuildSummary> {
        let pending = {
            let mut pending = lock(&self.inner.pending);
            match pending.as_ref() {
                Some(build) => {
                    info!(
                        "Build already running for '{}', waiting for it",
                        self.inner.repository
                    );
                    build.clone()
                }
                None => {
                    if !force {
                        if let Some(mismatch) = self.stale_reason() {
                            return Err(mismatch.into());
                        }
                    }
                    let build = self.spawn_build(source, filters, force);
                    *pending = Some(build.clone());
                    build
                }
            }
        };

        pending.await
    }

    /// Enter `Building`/`Rebuilding` and run the build in its own task so it
    /// finishes even if every caller stops waiting.
    fn spawn_build(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
        force: bool,
    ) -> PendingBuild {
        let prior = {
            let mut state = self.write_state();
            let prior = state.clone();
            *state = match &prior {
                State::Ready(index) => State::Rebuilding(index.clone()),
                _ => State::Building,
            };
            prior
        };

        let previous = match &prior {
            State::Ready(index) if !force => Some(index.clone()),
            _ => None,
        };

        let kb = self.clone();
        let handle = tokio::spawn(async move {
            let result = kb.run_build(source, filters, previous).await;
            kb.finish_build(result, prior)
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(AppError::Other(format!("Build task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    fn finish_build(
        &self,
        result: AppResult<(BuildSummary, Arc<EmbeddingIndex>)>,
        prior: State,
    ) -> AppResult<BuildSummary> {
        let outcome = {
            let mut state = self.write_state();
            match result {
                Ok((summary, index)) => {
                    *state = State::Ready(index);
                    Ok(summary)
                }
                Err(e) => {
                    error!("Build for '{}' failed: {}", self.inner.repository, e);
                    *state = prior;
                    Err(e)
                }
            }
        };

        *lock(&self.inner.pending) = None;
        outcome
    }

    #[instrument(skip_all, fields(repository = %self.inner.repository))]
    async fn run_build(
        &self,
        source: Arc<dyn RepositorySource>,
        filters: PathFilters,
        previous: Option<Arc<EmbeddingIndex>>,
    ) -> AppResult<(BuildSummary, Arc<EmbeddingIndex>)> {
        let start = Instant::now();
        let config = &self.inner.config;
        let progress = lock(&self.inner.progress).clone();

        info!(
            "Building index for '{}' from '{}'",
            self.inner.repository,
            source.identity()
        );

        let (max_tokens, overlap) = (config.chunk_max_tokens, config.chunk_overlap_tokens);
        let discover_progress = progress.clone();
        let (units, document_count, skipped_files) = tokio::task::spawn_blocking(move || {
            let set = source.documents(&filters)?;
            discover_progress.discover(
                set.documents.len() as u64,
                set.skipped.len() as u64,
                source.identity(),
            );

            let total = set.documents.len() as u64;
            let mut units: Vec<Unit> = Vec::new();
            let mut document_count = 0;
            for (i, document) in set.documents.iter().enumerate() {
                let chunks = chunker::chunk(document, max_tokens, overlap);
                if !chunks.is_empty() {
                    document_count += 1;
                }
                units.extend(chunks);
                discover_progress.chunk(i as u64 + 1, total, units.len());
            }

            Ok::<_, AppError>((units, document_count, set.skipped))
        })
        .await
        .map_err(|e| AppError::Other(format!("Ingestion task failed: {}", e)))??;

        debug!(
            "Chunked {} documents into {} units",
            document_count,
            units.len()
        );

        let version = guard::expected_version(self.inner.embedder.as_ref());
        let outcome = index::build(
            units,
            self.inner.embedder.as_ref(),
            &BuildOptions::from(config),
            version,
            previous.as_deref(),
            &progress,
        )
        .await?;

        let index = Arc::new(outcome.index);
        let path = self.index_path();
        progress.index(index.len() as u64, &path.to_string_lossy());

        let to_save = index.clone();
        tokio::task::spawn_blocking(move || store::save(&to_save, &path))
            .await
            .map_err(|e| AppError::Other(format!("Store task failed: {}", e)))??;

        config::save_config(&self.inner.workspace, &self.inner.repository, config)?;

        let summary = BuildSummary {
            unit_count: index.len(),
            failed_unit_count: outcome.failures.len(),
            document_count,
            skipped_files,
            schema_version: index.version().clone(),
            duration_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            "Built index for '{}': {} units ({} reused, {} failed, {} files skipped) in {:.2}s",
            self.inner.repository,
            summary.unit_count,
            outcome.reused,
            summary.failed_unit_count,
            summary.skipped_files.len(),
            summary.duration_secs
        );

        Ok((summary, index))
    }

    /// The loaded index, or the reason queries are refused.
    fn ready_index(&self) -> AppResult<Arc<EmbeddingIndex>> {
        match &*self.read_state() {
            State::Ready(index) => Ok(index.clone()),
            State::Building | State::Rebuilding(_) => Err(AppError::BuildInProgress),
            State::Stale(mismatch) => Err(mismatch.clone().into()),
            State::Uninitialized => Err(AppError::NotReady(format!(
                "no index for '{}', run a build first",
                self.inner.repository
            ))),
        }
    }

    /// Retrieve the most relevant units for `text` without generating.
    pub async fn retrieve(&self, text: &str, top_k: usize) -> AppResult<RetrievalResult> {
        let index = self.ready_index()?;
        retriever::retrieve(
            text,
            self.inner.embedder.as_ref(),
            &index,
            top_k,
            &RetrievalFilters::from_config(&self.inner.config),
            self.inner.config.embed_timeout(),
        )
        .await
    }

    /// Answer `text` as a stream, using the configured `top_k`.
    pub async fn query(&self, text: &str) -> AppResult<AnswerStream> {
        self.query_with(text, self.inner.config.top_k).await
    }

    /// Answer `text` as a stream from the `top_k` best units.
    ///
    /// Rejected immediately unless the base is `Ready`.
    #[instrument(skip(self), fields(repository = %self.inner.repository))]
    pub async fn query_with(&self, text: &str, top_k: usize) -> AppResult<AnswerStream> {
        let retrieved = self.retrieve(text, top_k).await?;
        let history = self
            .inner
            .conversation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history(self.inner.config.history_token_budget);

        self.inner.orchestrator.answer(
            &self.inner.repository,
            text,
            &retrieved,
            &history,
            self.inner.conversation.clone(),
        )
    }

    /// Answer `text` and wait for the whole answer.
    pub async fn ask(&self, text: &str) -> AppResult<Answer> {
        self.query(text).await?.into_answer().await
    }

    /// Completed turns of this session, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.inner
            .conversation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .turns()
            .to_vec()
    }

    pub fn clear_conversation(&self) {
        self.inner
            .conversation
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("Cleared conversation for '{}'", self.inner.repository);
    }

    /// Append a turn that did not come from [`query`](Self::query).
    pub fn add_turn(&self, query: impl Into<String>, answer: impl Into<String>) {
        self.inner
            .conversation
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(Turn::new(query, answer));
    }

    pub fn stats(&self) -> KnowledgeBaseStats {
        let (state, unit_count, schema_version) = {
            let state = self.read_state();
            match &*state {
                State::Ready(index) | State::Rebuilding(index) => (
                    state.lifecycle(),
                    index.len(),
                    Some(index.version().clone()),
                ),
                State::Stale(mismatch) => (state.lifecycle(), 0, mismatch.stored.clone()),
                _ => (state.lifecycle(), 0, None),
            }
        };

        let store_size_bytes = fs::metadata(self.index_path())
            .map(|m| m.len())
            .unwrap_or(0);

        let conversation_turns = self
            .inner
            .conversation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        KnowledgeBaseStats {
            repository: self.inner.repository.clone(),
            state: state.as_str().to_string(),
            unit_count,
            schema_version,
            store_size_bytes,
            conversation_turns,
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
