//! Similarity retrieval over an embedding index.
//!
//! Exact brute-force cosine search: every stored vector is scored. Results
//! are ranked by score, ties broken by ingestion order, then filtered and
//! truncated to `top_k`.

use crate::config::KnowledgeBaseConfig;
use crate::embeddings::EmbeddingProvider;
use crate::index::{cosine_similarity, EmbeddingIndex};
use crate::types::{RetrievalResult, ScoredUnit};
use globset::{Glob, GlobSet, GlobSetBuilder};
use repowiki_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Post-filters applied to ranked results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilters {
    /// Minimum cosine similarity
    pub min_score: Option<f32>,

    /// Only keep units whose path matches one of these globs
    pub paths: Option<Vec<String>>,

    /// Drop units whose path matches one of these globs
    pub exclude_paths: Option<Vec<String>>,

    /// Keep only the best-ranked unit for each content hash
    pub dedupe_by_hash: bool,
}

impl RetrievalFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters configured for a knowledge base.
    pub fn from_config(config: &KnowledgeBaseConfig) -> Self {
        Self {
            min_score: config.min_score,
            dedupe_by_hash: config.dedupe_by_hash,
            ..Self::default()
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn with_exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.exclude_paths = Some(paths);
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe_by_hash = dedupe;
        self
    }

    /// Filter a ranked list down to at most `top_k` entries, keeping order.
    pub fn apply(&self, ranked: Vec<ScoredUnit>, top_k: usize) -> AppResult<RetrievalResult> {
        let include = self.paths.as_deref().map(compile).transpose()?;
        let exclude = self.exclude_paths.as_deref().map(compile).transpose()?;
        let mut seen = HashSet::new();

        let filtered = ranked
            .into_iter()
            .filter(|scored| self.min_score.map_or(true, |min| scored.score >= min))
            .filter(|scored| {
                include
                    .as_ref()
                    .map_or(true, |set| set.is_match(&scored.unit.path))
            })
            .filter(|scored| {
                !exclude
                    .as_ref()
                    .is_some_and(|set| set.is_match(&scored.unit.path))
            })
            .filter(|scored| !self.dedupe_by_hash || seen.insert(scored.unit.hash.clone()))
            .take(top_k)
            .collect();

        Ok(filtered)
    }
}

fn compile(patterns: &[String]) -> AppResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| AppError::Config(format!("Invalid path filter '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| AppError::Config(format!("Failed to compile path filters: {}", e)))
}

/// Score every entry of `index` against `query_vector`, best first.
///
/// Equal scores keep ingestion order.
pub fn rank(query_vector: &[f32], index: &EmbeddingIndex) -> Vec<ScoredUnit> {
    let mut scored: Vec<ScoredUnit> = index
        .entries()
        .iter()
        .enumerate()
        .map(|(ordinal, entry)| ScoredUnit {
            unit: entry.unit.clone(),
            score: cosine_similarity(query_vector, &entry.vector),
            ordinal,
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.ordinal.cmp(&b.ordinal)));

    scored
}

/// Embed `query` and return the `top_k` most similar units.
///
/// The query embedding must finish within `timeout`. The provider must
/// produce vectors of the index's dimension; anything else means the wrong
/// provider was wired in and fails immediately.
pub async fn retrieve(
    query: &str,
    provider: &dyn EmbeddingProvider,
    index: &EmbeddingIndex,
    top_k: usize,
    filters: &RetrievalFilters,
    timeout: Duration,
) -> AppResult<RetrievalResult> {
    let query_vector = tokio::time::timeout(timeout, provider.embed(query))
        .await
        .map_err(|_| {
            AppError::Embedding(format!("query embedding timed out after {:?}", timeout))
        })??;

    if query_vector.len() != index.version().dimension {
        return Err(AppError::Embedding(format!(
            "query vector has dimension {}, index was built with {}",
            query_vector.len(),
            index.version().dimension
        )));
    }

    let results = filters.apply(rank(&query_vector, index), top_k)?;

    tracing::debug!(
        "Retrieved {} of {} units (top-{}), best score {:.3}",
        results.len(),
        index.len(),
        top_k,
        results.first().map(|r| r.score).unwrap_or(0.0)
    );

    Ok(results)
}
