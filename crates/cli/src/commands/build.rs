//! Build command handler.
//!
//! Ingests a local checkout into its knowledge base.

use super::{local_source, open_knowledge_base, stderr_progress};
use clap::Args;
use repowiki_core::{config::AppConfig, AppError, AppResult};
use repowiki_knowledge::PathFilters;

/// Build or update the knowledge base for a repository
#[derive(Args, Debug)]
pub struct BuildCommand {
    /// Path to a local checkout
    pub repo: String,

    /// Only ingest paths matching these globs
    #[arg(long)]
    pub include: Vec<String>,

    /// Skip paths matching these globs
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Re-embed everything, replacing a stale or incompatible index
    #[arg(long)]
    pub force: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl BuildCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing build command for '{}'", self.repo);
        tracing::debug!("Build options: {:?}", self);

        let source = local_source(&self.repo)?;
        let kb = open_knowledge_base(config, &self.repo)?;
        if !self.json {
            kb.set_progress(stderr_progress());
        }

        let filters = PathFilters {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        };

        let result = if self.force {
            kb.rebuild(source, filters).await
        } else {
            kb.build(source, filters).await
        };

        let summary = match result {
            Ok(summary) => summary,
            Err(e @ AppError::SchemaMismatch(_)) => {
                eprintln!("The stored index is incompatible; run again with --force to rebuild it");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if self.json {
            let output = serde_json::json!({
                "repository": kb.repository(),
                "unitCount": summary.unit_count,
                "failedUnitCount": summary.failed_unit_count,
                "documentCount": summary.document_count,
                "skippedFiles": summary.skipped_files,
                "schemaVersion": summary.schema_version,
                "durationSecs": summary.duration_secs,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!(
                "Built '{}': {} units from {} files in {:.2}s",
                kb.repository(),
                summary.unit_count,
                summary.document_count,
                summary.duration_secs
            );
            if summary.failed_unit_count > 0 {
                println!("{} units failed to embed and were left out", summary.failed_unit_count);
            }
            if !summary.skipped_files.is_empty() {
                println!("Skipped {} files:", summary.skipped_files.len());
                for skipped in &summary.skipped_files {
                    println!("  {} ({})", skipped.path, skipped.reason);
                }
            }
            println!("Index: {} ({})", kb.index_path().display(), summary.schema_version);
        }

        Ok(())
    }
}
