//! Repository knowledge bases.
//!
//! Ingests a repository into line-range units, embeds them into a SQLite
//! backed index and answers questions about the code with retrieval-augmented
//! generation. [`KnowledgeBase`] ties the pieces together for one repository.

pub mod chunker;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod guard;
pub mod index;
pub mod knowledge_base;
pub mod progress;
pub mod rag;
pub mod retriever;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::{KnowledgeBaseConfig, PathFilters};
pub use embeddings::{create_provider, EmbeddingConfig, EmbeddingProvider};
pub use index::EmbeddingIndex;
pub use knowledge_base::{KnowledgeBase, LifecycleState};
pub use progress::{BuildPhase, ProgressEvent, ProgressReporter};
pub use rag::{Answer, AnswerEvent, AnswerOrchestrator, AnswerStream};
pub use retriever::RetrievalFilters;
pub use source::{repository_identity, DocumentSet, FsRepositorySource, RepositorySource};
pub use types::{
    BuildSummary, Document, KnowledgeBaseStats, Provenance, RetrievalResult, ScoredUnit,
    SkippedFile, Turn, Unit, UnitFailure,
};
