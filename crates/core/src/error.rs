//! Error types for the Repowiki CLI.
//!
//! This module defines a unified error enum that covers all error categories
//! in the application: configuration, I/O, ingestion, embedding, index
//! storage, schema versioning, generation, and lifecycle errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of a persisted index: everything that must match exactly for
/// stored vectors to be comparable with freshly embedded queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// On-disk layout version of the store
    pub format_version: u32,

    /// Embedding model identifier ("<provider>/<model>")
    pub embedding_model: String,

    /// Vector dimension produced by the embedding model
    pub dimension: usize,

    /// When the index was built (informational, not compared)
    pub built_at: DateTime<Utc>,
}

impl SchemaVersion {
    /// Whether two versions describe compatible indexes.
    ///
    /// The build timestamp is deliberately excluded.
    pub fn is_compatible_with(&self, other: &SchemaVersion) -> bool {
        self.format_version == other.format_version
            && self.embedding_model == other.embedding_model
            && self.dimension == other.dimension
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.is_compatible_with(other)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "format v{}, model '{}', dimension {}",
            self.format_version, self.embedding_model, self.dimension
        )
    }
}

/// A persisted index whose version does not match what the running code expects.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMismatch {
    /// Version found on disk, `None` when the store carries no version record
    pub stored: Option<SchemaVersion>,

    /// Version the current configuration expects
    pub expected: SchemaVersion,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stored {
            Some(stored) => write!(
                f,
                "index schema mismatch: found ({}), expected ({}). Rebuild the knowledge base.",
                stored, self.expected
            ),
            None => write!(
                f,
                "index has no schema version record, expected ({}). Rebuild the knowledge base.",
                self.expected
            ),
        }
    }
}

/// Unified error type for the Repowiki CLI.
///
/// All functions in the application return `Result<T, AppError>`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LLM provider errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// A source file could not be read or the filters are invalid
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// An embedding call failed (possibly after retries)
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Too many units failed to embed; nothing was persisted
    #[error("Build aborted: {failed} of {total} units failed to embed (threshold {threshold:.2})")]
    BuildAborted {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    /// The persisted index was produced by an incompatible configuration
    #[error("{0}")]
    SchemaMismatch(Box<SchemaMismatch>),

    /// A query arrived while the index is being built
    #[error("Build in progress: queries are rejected until the index is ready")]
    BuildInProgress,

    /// The knowledge base has no usable index yet
    #[error("Knowledge base is not ready: {0}")]
    NotReady(String),

    /// Generation failed for the in-flight query
    #[error("Generation error: {0}")]
    Generation(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Index store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Knowledge base and RAG errors
    #[error("Knowledge error: {0}")]
    Knowledge(String),

    /// Prompt system errors
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Embedding(_) | AppError::Llm(_) | AppError::Io(_))
    }

    /// The schema mismatch carried by this error, if any.
    pub fn as_schema_mismatch(&self) -> Option<&SchemaMismatch> {
        match self {
            AppError::SchemaMismatch(mismatch) => Some(mismatch),
            _ => None,
        }
    }
}

// Coalesced builds hand the same outcome to every waiting caller.
impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::Config(s) => AppError::Config(s.clone()),
            AppError::Io(e) => AppError::Io(std::io::Error::new(e.kind(), e.to_string())),
            AppError::Llm(s) => AppError::Llm(s.clone()),
            AppError::Ingestion(s) => AppError::Ingestion(s.clone()),
            AppError::Embedding(s) => AppError::Embedding(s.clone()),
            AppError::BuildAborted {
                failed,
                total,
                threshold,
            } => AppError::BuildAborted {
                failed: *failed,
                total: *total,
                threshold: *threshold,
            },
            AppError::SchemaMismatch(m) => AppError::SchemaMismatch(m.clone()),
            AppError::BuildInProgress => AppError::BuildInProgress,
            AppError::NotReady(s) => AppError::NotReady(s.clone()),
            AppError::Generation(s) => AppError::Generation(s.clone()),
            AppError::Cancelled => AppError::Cancelled,
            AppError::Storage(s) => AppError::Storage(s.clone()),
            AppError::Knowledge(s) => AppError::Knowledge(s.clone()),
            AppError::Prompt(s) => AppError::Prompt(s.clone()),
            AppError::Serialization(s) => AppError::Serialization(s.clone()),
            AppError::Other(s) => AppError::Other(s.clone()),
        }
    }
}

impl From<SchemaMismatch> for AppError {
    fn from(mismatch: SchemaMismatch) -> Self {
        AppError::SchemaMismatch(Box::new(mismatch))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn version(model: &str, dimension: usize) -> SchemaVersion {
        SchemaVersion {
            format_version: 1,
            embedding_model: model.to_string(),
            dimension,
            built_at: Utc::now(),
        }
    }

    #[test]
    fn test_schema_version_equality_ignores_timestamp() {
        let a = version("trigram/trigram-v1", 384);
        let mut b = a.clone();
        b.built_at = a.built_at - chrono::Duration::days(3);
        assert_eq!(a, b);
        assert_ne!(a, version("trigram/trigram-v1", 768));
        assert_ne!(a, version("ollama/nomic-embed-text", 384));
    }

    #[test]
    fn test_schema_mismatch_message_asks_for_rebuild() {
        let err: AppError = SchemaMismatch {
            stored: Some(version("ollama/nomic-embed-text", 768)),
            expected: version("trigram/trigram-v1", 384),
        }
        .into();

        let msg = err.to_string();
        assert!(msg.contains("nomic-embed-text"));
        assert!(msg.contains("Rebuild"));
        assert!(err.as_schema_mismatch().is_some());
    }

    #[test]
    fn test_schema_mismatch_without_stored_version() {
        let mismatch = SchemaMismatch {
            stored: None,
            expected: version("trigram/trigram-v1", 384),
        };
        assert!(mismatch.to_string().contains("no schema version record"));
    }

    #[test]
    fn test_clone_preserves_io_kind() {
        let err = AppError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing file",
        ));
        match err.clone() {
            AppError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert!(e.to_string().contains("missing file"));
            }
            other => panic!("unexpected clone: {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Embedding("timeout".into()).is_transient());
        assert!(!AppError::BuildInProgress.is_transient());
        assert!(!AppError::Config("bad".into()).is_transient());
    }
}
