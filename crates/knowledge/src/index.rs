//! In-memory embedding index and its concurrent builder.

use crate::config::KnowledgeBaseConfig;
use crate::embeddings::{model_id, EmbeddingProvider};
use crate::progress::ProgressReporter;
use crate::types::{Unit, UnitFailure};
use futures::stream::{self, StreamExt};
use repowiki_core::{AppError, AppResult, SchemaVersion};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A unit and its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub unit: Unit,
    pub vector: Vec<f32>,
}

/// Units and vectors that share one schema version.
///
/// Entry order is ingestion order and serves as the retrieval tie-breaker.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingIndex {
    version: SchemaVersion,
    entries: Vec<IndexEntry>,
}

impl EmbeddingIndex {
    /// Create an index, rejecting vectors of the wrong dimension.
    pub fn new(version: SchemaVersion, entries: Vec<IndexEntry>) -> AppResult<Self> {
        if let Some(bad) = entries
            .iter()
            .find(|entry| entry.vector.len() != version.dimension)
        {
            return Err(AppError::Storage(format!(
                "vector for {} has dimension {}, index expects {}",
                bad.unit.tag(),
                bad.vector.len(),
                version.dimension
            )));
        }

        Ok(Self { version, entries })
    }

    pub fn version(&self) -> &SchemaVersion {
        &self.version
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vectors keyed by content hash, for reuse by an incremental build.
    fn vectors_by_hash(&self) -> HashMap<&str, &[f32]> {
        self.entries
            .iter()
            .map(|entry| (entry.unit.hash.as_str(), entry.vector.as_slice()))
            .collect()
    }
}

/// Knobs for [`build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Embedding calls in flight at once
    pub concurrency: usize,

    /// Attempts per unit, including the first
    pub max_attempts: u32,

    /// Delay before the first retry; doubles after each attempt
    pub initial_backoff: Duration,

    /// Limit for a single embedding call
    pub timeout: Duration,

    /// Failed fraction above which the build aborts
    pub max_failure_ratio: f64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from(&KnowledgeBaseConfig::default())
    }
}

impl From<&KnowledgeBaseConfig> for BuildOptions {
    fn from(config: &KnowledgeBaseConfig) -> Self {
        Self {
            concurrency: config.embed_concurrency,
            max_attempts: config.embed_max_attempts,
            initial_backoff: config.embed_initial_backoff(),
            timeout: config.embed_timeout(),
            max_failure_ratio: config.max_failure_ratio,
        }
    }
}

/// A successful build: the index plus the units left out of it.
#[derive(Debug)]
pub struct BuildOutcome {
    pub index: EmbeddingIndex,
    pub failures: Vec<UnitFailure>,

    /// Vectors copied from the previous index instead of re-embedded
    pub reused: usize,
}

/// Embed `units` and assemble an index.
///
/// Calls run through a pool of `options.concurrency` in-flight requests and
/// results are slotted back by ordinal, so completion order never matters.
/// A unit whose hash appears in `previous` (built under a compatible version)
/// keeps its old vector. Units that still fail after retries are left out;
/// if they exceed `max_failure_ratio` of the total, the build is aborted.
pub async fn build(
    units: Vec<Unit>,
    provider: &dyn EmbeddingProvider,
    options: &BuildOptions,
    version: SchemaVersion,
    previous: Option<&EmbeddingIndex>,
    progress: &ProgressReporter,
) -> AppResult<BuildOutcome> {
    let total = units.len();
    let model = model_id(provider);
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; total];
    let mut failures: Vec<(usize, AppError)> = Vec::new();

    let cached = previous
        .filter(|prev| prev.version().is_compatible_with(&version))
        .map(EmbeddingIndex::vectors_by_hash)
        .unwrap_or_default();

    let mut pending = Vec::new();
    for (ordinal, unit) in units.iter().enumerate() {
        match cached.get(unit.hash.as_str()) {
            Some(vector) => slots[ordinal] = Some(vector.to_vec()),
            None => pending.push((ordinal, unit.text.clone())),
        }
    }
    let reused = total - pending.len();

    info!(
        "Embedding {} units with {} ({} reused, concurrency {})",
        pending.len(),
        model,
        reused,
        options.concurrency
    );

    {
        let mut results = stream::iter(pending)
            .map(move |(ordinal, text): (usize, String)| async move {
                (ordinal, embed_with_retry(provider, &text, options).await)
            })
            .buffer_unordered(options.concurrency.max(1));

        let mut done = reused as u64;
        while let Some((ordinal, result)) = results.next().await {
            done += 1;
            match result {
                Ok(vector) => slots[ordinal] = Some(vector),
                Err(e) => {
                    warn!("Excluding {} from index: {}", units[ordinal].tag(), e);
                    failures.push((ordinal, e));
                }
            }
            progress.embed(done, total as u64, &model);
        }
    }

    let failed = failures.len();
    if total > 0 && failed as f64 / total as f64 > options.max_failure_ratio {
        error!(
            "Aborting build: {} of {} units failed to embed (threshold {:.2})",
            failed, total, options.max_failure_ratio
        );
        return Err(AppError::BuildAborted {
            failed,
            total,
            threshold: options.max_failure_ratio,
        });
    }

    failures.sort_by_key(|(ordinal, _)| *ordinal);
    let failures = failures
        .into_iter()
        .map(|(ordinal, e)| {
            let unit = &units[ordinal];
            UnitFailure {
                path: unit.path.clone(),
                start_line: unit.start_line,
                end_line: unit.end_line,
                error: e.to_string(),
            }
        })
        .collect();

    let entries = units
        .into_iter()
        .zip(slots)
        .filter_map(|(unit, slot)| slot.map(|vector| IndexEntry { unit, vector }))
        .collect();

    let index = EmbeddingIndex::new(version, entries)?;
    debug!("Built index with {} entries ({} failed)", index.len(), failed);

    Ok(BuildOutcome {
        index,
        failures,
        reused,
    })
}

/// One embedding call with a timeout, retried with exponential backoff on
/// transient errors.
async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    text: &str,
    options: &BuildOptions,
) -> AppResult<Vec<f32>> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(options.timeout, provider.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Embedding(format!(
                "embedding call timed out after {:?}",
                options.timeout
            ))),
        };

        match result {
            Ok(vector) if vector.len() == provider.dimensions() => return Ok(vector),
            Ok(vector) => {
                return Err(AppError::Embedding(format!(
                    "provider returned {} dimensions, expected {}",
                    vector.len(),
                    provider.dimensions()
                )))
            }
            Err(e) if e.is_transient() && attempt < options.max_attempts => {
                let delay = options
                    .initial_backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 1));
                warn!(
                    "Embedding attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, options.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::content_hash;
    use crate::guard::expected_version;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn unit(path: &str, line: usize, text: &str) -> Unit {
        Unit {
            path: path.to_string(),
            start_line: line,
            end_line: line,
            text: text.to_string(),
            hash: content_hash(text),
        }
    }

    fn fast_options() -> BuildOptions {
        BuildOptions {
            concurrency: 3,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            max_failure_ratio: 0.10,
        }
    }

    /// Embeds text as `[len, first byte]`, finishing in reverse length order
    /// and failing for configured texts.
    #[derive(Debug, Default)]
    struct ScriptedProvider {
        calls: AtomicUsize,
        always_fail: HashSet<String>,
        fail_first: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "v1"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for text in texts {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // Longer texts finish first
                tokio::time::sleep(Duration::from_millis(50 - text.len() as u64)).await;

                if self.always_fail.contains(text) {
                    return Err(AppError::Embedding(format!("rate limited: {}", text)));
                }
                if self.fail_first.lock().unwrap().remove(text) {
                    return Err(AppError::Embedding(format!("flaky: {}", text)));
                }
                out.push(vec![text.len() as f32, text.as_bytes()[0] as f32]);
            }
            Ok(out)
        }
    }

    fn units(count: usize) -> Vec<Unit> {
        (0..count)
            .map(|i| unit("src/lib.rs", i + 1, &"x".repeat(i + 1)))
            .collect()
    }

    #[tokio::test]
    async fn test_vectors_follow_units_regardless_of_completion_order() {
        let provider = ScriptedProvider::default();
        let version = expected_version(&provider);

        let outcome = build(
            units(8),
            &provider,
            &fast_options(),
            version,
            None,
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.index.len(), 8);
        assert!(outcome.failures.is_empty());
        for entry in outcome.index.entries() {
            assert_eq!(entry.vector[0], entry.unit.text.len() as f32);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let provider = ScriptedProvider {
            fail_first: Mutex::new(["xx".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let version = expected_version(&provider);

        let outcome = build(
            units(3),
            &provider,
            &fast_options(),
            version,
            None,
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.index.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_are_excluded() {
        let provider = ScriptedProvider {
            always_fail: ["xxx".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let version = expected_version(&provider);
        let options = BuildOptions {
            max_failure_ratio: 0.25,
            ..fast_options()
        };

        let outcome = build(
            units(5),
            &provider,
            &options,
            version,
            None,
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.index.len(), 4);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].start_line, 3);
        assert!(outcome
            .index
            .entries()
            .iter()
            .all(|entry| entry.unit.text != "xxx"));
        // One unit, three attempts
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4 + 3);
    }

    #[tokio::test]
    async fn test_failures_above_threshold_abort() {
        let provider = ScriptedProvider {
            always_fail: ["x".to_string(), "xx".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let version = expected_version(&provider);

        let result = build(
            units(10),
            &provider,
            &fast_options(),
            version,
            None,
            &ProgressReporter::noop(),
        )
        .await;

        match result {
            Err(AppError::BuildAborted { failed, total, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 10);
            }
            other => panic!("expected BuildAborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_build_reuses_unchanged_vectors() {
        let provider = ScriptedProvider::default();
        let version = expected_version(&provider);

        let first = build(
            units(4),
            &provider,
            &fast_options(),
            version.clone(),
            None,
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        let second = build(
            units(6),
            &provider,
            &fast_options(),
            version,
            Some(&first.index),
            &ProgressReporter::noop(),
        )
        .await
        .unwrap();

        assert_eq!(second.reused, 4);
        assert_eq!(second.index.len(), 6);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_index_rejects_wrong_dimension() {
        let provider = ScriptedProvider::default();
        let entries = vec![IndexEntry {
            unit: unit("a.py", 1, "a"),
            vector: vec![1.0, 2.0, 3.0],
        }];
        assert!(EmbeddingIndex::new(expected_version(&provider), entries).is_err());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
