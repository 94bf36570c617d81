//! Knowledge system type definitions.

use chrono::{DateTime, Utc};
use repowiki_core::SchemaVersion;
use serde::{Deserialize, Serialize};

/// A source file read from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path relative to the repository root, `/`-separated
    pub path: String,

    /// Full UTF-8 contents
    pub text: String,

    /// Size on disk in bytes
    pub size: u64,
}

impl Document {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            path: path.into(),
            size: text.len() as u64,
            text,
        }
    }
}

/// A contiguous run of lines from one document; the atomic retrievable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Source path relative to the repository root
    pub path: String,

    /// First line, 1-based, inclusive
    pub start_line: usize,

    /// Last line, 1-based, inclusive
    pub end_line: usize,

    /// Text content of the lines
    pub text: String,

    /// SHA-256 of `text`, hex encoded
    pub hash: String,
}

impl Unit {
    /// Citation tag used in prompts and output, `path:start-end`.
    pub fn tag(&self) -> String {
        format!("{}:{}-{}", self.path, self.start_line, self.end_line)
    }
}

/// A unit paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredUnit {
    pub unit: Unit,

    /// Cosine similarity in [-1, 1]
    pub score: f32,

    /// Position of the unit in ingestion order
    pub ordinal: usize,
}

/// Units ranked by non-increasing score.
pub type RetrievalResult = Vec<ScoredUnit>;

/// Where an answer's context came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f32,
}

impl From<&ScoredUnit> for Provenance {
    fn from(scored: &ScoredUnit) -> Self {
        Self {
            path: scored.unit.path.clone(),
            start_line: scored.unit.start_line,
            end_line: scored.unit.end_line,
            score: scored.score,
        }
    }
}

/// One completed question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A unit that could not be embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailure {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub error: String,
}

/// A file that was skipped during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Units stored in the index
    pub unit_count: usize,

    /// Units excluded after exhausting embedding retries
    pub failed_unit_count: usize,

    /// Documents that produced units
    pub document_count: usize,

    /// Files skipped during ingestion
    pub skipped_files: Vec<SkippedFile>,

    /// Version recorded with the persisted index
    pub schema_version: SchemaVersion,

    /// Wall-clock duration of the build
    pub duration_secs: f64,
}

/// Statistics for a knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    /// Repository identity
    pub repository: String,

    /// Lifecycle state name
    pub state: String,

    /// Number of units in the loaded index
    pub unit_count: usize,

    /// Version of the loaded index, if any
    pub schema_version: Option<SchemaVersion>,

    /// Size of the store on disk
    pub store_size_bytes: u64,

    /// Turns in the current conversation
    pub conversation_turns: usize,
}
