//! Ask command handler.
//!
//! Answers a single question about a repository.

use super::{open_ready, print_answer_stream};
use clap::Args;
use repowiki_core::{config::AppConfig, AppResult};

/// Ask a single question about a repository
#[derive(Args, Debug)]
pub struct AskCommand {
    /// Path to a local checkout, or the URL it was built from
    pub repo: String,

    /// The question to ask
    pub question: String,

    /// Number of excerpts to retrieve
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Wait for the whole answer instead of streaming it
    #[arg(long)]
    pub no_stream: bool,

    /// Output as JSON (implies --no-stream)
    #[arg(long)]
    pub json: bool,
}

impl AskCommand {
    /// Execute the ask command.
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing ask command for '{}'", self.repo);
        tracing::debug!("Ask command options: {:?}", self);

        let kb = open_ready(config, &self.repo).await?;
        let top_k = self.top_k.unwrap_or(kb.config().top_k);

        if self.is_streaming() {
            let stream = kb.query_with(&self.question, top_k).await?;
            print_answer_stream(stream, &self.question).await?;
            return Ok(());
        }

        let answer = kb.query_with(&self.question, top_k).await?.into_answer().await?;

        if self.json {
            let output = serde_json::json!({
                "repository": kb.repository(),
                "question": answer.question,
                "answer": answer.answer,
                "provider": config.provider,
                "model": config.model,
                "provenance": answer.provenance,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", answer.answer);
            if !answer.provenance.is_empty() {
                println!("\nSources:\n{}", answer.format_sources());
            }
        }

        Ok(())
    }

    /// Check if streaming is enabled.
    pub fn is_streaming(&self) -> bool {
        !self.no_stream && !self.json
    }
}
