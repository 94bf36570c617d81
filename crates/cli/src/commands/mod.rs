//! Command handlers for the repowiki CLI.
//!
//! This module organizes all CLI commands into separate submodules, plus the
//! helpers they share for opening knowledge bases and printing answers.

pub mod ask;
pub mod build;
pub mod chat;
pub mod stats;

// Re-export command types for convenience
pub use ask::AskCommand;
pub use build::BuildCommand;
pub use chat::ChatCommand;
pub use stats::StatsCommand;

use futures::StreamExt;
use repowiki_core::{config::AppConfig, AppError, AppResult};
use repowiki_knowledge::{
    repository_identity, Answer, AnswerEvent, AnswerStream, FsRepositorySource, KnowledgeBase,
    PathFilters, ProgressEvent, ProgressReporter, RepositorySource,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Open the knowledge base for a repository path or URL.
pub fn open_knowledge_base(config: &AppConfig, repo: &str) -> AppResult<KnowledgeBase> {
    let identity = repository_identity(repo);
    tracing::debug!("Repository '{}' has identity '{}'", repo, identity);
    KnowledgeBase::open_with_app_config(config, &identity)
}

/// A source for a local checkout. Remote URLs only name a knowledge base.
pub fn local_source(repo: &str) -> AppResult<Arc<dyn RepositorySource>> {
    if !Path::new(repo).is_dir() {
        return Err(AppError::Ingestion(format!(
            "'{}' is not a local directory; clone it first and pass the checkout path",
            repo
        )));
    }
    Ok(Arc::new(FsRepositorySource::new(repo)?))
}

/// Open a knowledge base and, for a local checkout, build it if nothing is
/// stored yet.
pub async fn open_ready(config: &AppConfig, repo: &str) -> AppResult<KnowledgeBase> {
    let kb = open_knowledge_base(config, repo)?;

    if Path::new(repo).is_dir() {
        kb.set_progress(stderr_progress());
        if let Some(summary) = kb.ensure_ready(local_source(repo)?, PathFilters::new()).await? {
            eprintln!(
                "Indexed {} units from {} files",
                summary.unit_count, summary.document_count
            );
        }
    }

    Ok(kb)
}

/// Progress lines on stderr so stdout stays clean.
pub fn stderr_progress() -> ProgressReporter {
    ProgressReporter::new(Arc::new(|event: ProgressEvent| eprintln!("{}", event.format_simple())))
}

/// Print an answer as it streams in, then its sources.
///
/// Ctrl-C cancels the answer. Returns whether the answer completed.
pub async fn print_answer_stream(mut stream: AnswerStream, question: &str) -> AppResult<bool> {
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(AnswerEvent::Fragment(text))) => {
                    print!("{}", text);
                    stdout.flush().ok();
                }
                Some(Err(e)) => {
                    println!();
                    return Err(e);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                println!();
                eprintln!("(answer cancelled)");
                return Ok(false);
            }
        }
    }

    println!();

    if !stream.is_completed() {
        return Ok(false);
    }

    let answer = Answer {
        question: question.to_string(),
        answer: stream.text().to_string(),
        provenance: stream.provenance().to_vec(),
    };
    if !answer.provenance.is_empty() {
        println!("\nSources:\n{}", answer.format_sources());
    }

    Ok(true)
}
