//! Knowledge base configuration management.

use crate::embeddings::EmbeddingConfig;
use globset::{Glob, GlobSet, GlobSetBuilder};
use repowiki_core::config::STATE_DIR;
use repowiki_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the persisted index inside a base directory.
pub const INDEX_FILE: &str = "index.sqlite";

/// Directories and files never ingested.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/.repowiki/**",
    "**/__pycache__/**",
    "**/.pytest_cache/**",
    "**/node_modules/**",
    "**/.venv/**",
    "**/venv/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/*.pyc",
    "**/*.pyo",
    "**/*.log",
    "**/*.tmp",
    "**/*.cache",
    "**/*.lock",
    "**/.DS_Store",
    "**/Thumbs.db",
];

/// Configuration for a knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// Chunk size budget in estimated tokens
    pub chunk_max_tokens: usize,

    /// Trailing context repeated at the start of the next chunk
    pub chunk_overlap_tokens: usize,

    /// Embedding calls in flight during a build
    pub embed_concurrency: usize,

    /// Attempts per unit before it is recorded as failed
    pub embed_max_attempts: u32,

    /// First retry delay; doubles on each further attempt
    pub embed_initial_backoff_ms: u64,

    /// Timeout for a single embedding call
    pub embed_timeout_secs: u64,

    /// Fraction of failed units above which the build is aborted
    pub max_failure_ratio: f64,

    /// Units retrieved per query
    pub top_k: usize,

    /// Units scoring below this are dropped
    pub min_score: Option<f32>,

    /// Collapse units with identical content before truncating to `top_k`
    pub dedupe_by_hash: bool,

    /// Estimated tokens of history included in a prompt
    pub history_token_budget: usize,

    /// Timeout for one generation attempt
    pub generation_timeout_secs: u64,

    /// How long a cancelled generation may take to wind down
    pub cancel_grace_ms: u64,

    /// Embedding provider settings
    pub embedding: EmbeddingConfig,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            chunk_max_tokens: 350,
            chunk_overlap_tokens: 40,
            embed_concurrency: 4,
            embed_max_attempts: 3,
            embed_initial_backoff_ms: 200,
            embed_timeout_secs: 30,
            max_failure_ratio: 0.10,
            top_k: 5,
            min_score: None,
            dedupe_by_hash: true,
            history_token_budget: 1024,
            generation_timeout_secs: 120,
            cancel_grace_ms: 500,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn embed_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.embed_initial_backoff_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Reject settings that would make builds or queries meaningless.
    pub fn validate(&self) -> AppResult<()> {
        if self.chunk_max_tokens == 0 {
            return Err(AppError::Config(
                "chunk_max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(AppError::Config(format!(
                "chunk_overlap_tokens ({}) must be smaller than chunk_max_tokens ({})",
                self.chunk_overlap_tokens, self.chunk_max_tokens
            )));
        }

        if self.embed_concurrency == 0 || self.embed_max_attempts == 0 {
            return Err(AppError::Config(
                "embed_concurrency and embed_max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.max_failure_ratio) {
            return Err(AppError::Config(format!(
                "max_failure_ratio must be within [0, 1], got {}",
                self.max_failure_ratio
            )));
        }

        if self.top_k == 0 {
            return Err(AppError::Config("top_k must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// Include/exclude globs applied to paths relative to the repository root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathFilters {
    /// When non-empty, only matching paths are ingested
    #[serde(default)]
    pub include: Vec<String>,

    /// Matching paths are skipped, in addition to [`DEFAULT_EXCLUDES`]
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl PathFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Compile the globs. An invalid glob is an ingestion error.
    pub fn compile(&self) -> AppResult<CompiledFilters> {
        let include = if self.include.is_empty() {
            None
        } else {
            Some(build_globset(self.include.iter().map(String::as_str))?)
        };

        let exclude = build_globset(
            DEFAULT_EXCLUDES
                .iter()
                .copied()
                .chain(self.exclude.iter().map(String::as_str)),
        )?;

        Ok(CompiledFilters { include, exclude })
    }
}

/// Compiled form of [`PathFilters`].
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl CompiledFilters {
    /// Whether a relative path should be ingested.
    pub fn is_included(&self, relative_path: &str) -> bool {
        if self.exclude.is_match(relative_path) {
            return false;
        }

        match &self.include {
            Some(include) => include.is_match(relative_path),
            None => true,
        }
    }

    /// Whether a directory can be pruned from the walk.
    pub fn is_excluded_dir(&self, relative_dir: &str) -> bool {
        self.exclude.is_match(format!("{}/_", relative_dir))
    }
}

fn build_globset<'a>(patterns: impl IntoIterator<Item = &'a str>) -> AppResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| AppError::Ingestion(format!("Invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AppError::Ingestion(format!("Failed to compile globs: {}", e)))
}

/// Load knowledge base configuration.
///
/// Loads from `.repowiki/bases/<repo-id>/config.yaml` if it exists,
/// otherwise returns the defaults.
pub fn load_config(workspace: &Path, repo_id: &str) -> AppResult<KnowledgeBaseConfig> {
    let config_path = get_config_path(workspace, repo_id);

    if !config_path.exists() {
        tracing::debug!(
            "Using default knowledge base config for '{}' (no config file found)",
            repo_id
        );
        return Ok(KnowledgeBaseConfig::default());
    }

    let content = fs::read_to_string(&config_path).map_err(|e| {
        AppError::Config(format!("Failed to read config at {:?}: {}", config_path, e))
    })?;

    let config: KnowledgeBaseConfig = serde_yaml::from_str(&content).map_err(|e| {
        AppError::Config(format!("Failed to parse config at {:?}: {}", config_path, e))
    })?;

    config.validate()?;

    tracing::debug!("Loaded knowledge base config for '{}'", repo_id);
    Ok(config)
}

/// Save knowledge base configuration.
pub fn save_config(workspace: &Path, repo_id: &str, config: &KnowledgeBaseConfig) -> AppResult<()> {
    let config_path = get_config_path(workspace, repo_id);

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let yaml = serde_yaml::to_string(config)?;
    fs::write(&config_path, yaml).map_err(|e| {
        AppError::Config(format!("Failed to write config to {:?}: {}", config_path, e))
    })?;

    tracing::debug!("Saved knowledge base config for '{}'", repo_id);
    Ok(())
}

/// Get the base directory for a knowledge base.
pub fn get_base_dir(workspace: &Path, repo_id: &str) -> PathBuf {
    workspace.join(STATE_DIR).join("bases").join(repo_id)
}

/// Get the path to a base's config file.
pub fn get_config_path(workspace: &Path, repo_id: &str) -> PathBuf {
    get_base_dir(workspace, repo_id).join("config.yaml")
}

/// Get the SQLite index path for a base.
pub fn get_index_path(workspace: &Path, repo_id: &str) -> PathBuf {
    get_base_dir(workspace, repo_id).join(INDEX_FILE)
}
