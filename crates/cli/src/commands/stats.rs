//! Stats command handler.
//!
//! Shows what is stored for a repository's knowledge base.

use super::open_knowledge_base;
use clap::Args;
use repowiki_core::{config::AppConfig, AppResult};

/// Show knowledge base statistics
#[derive(Args, Debug)]
pub struct StatsCommand {
    /// Path to a local checkout, or the URL it was built from
    pub repo: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl StatsCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing stats command for '{}'", self.repo);

        let kb = open_knowledge_base(config, &self.repo)?;
        let stats = kb.stats();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }

        println!("Repository:  {}", stats.repository);
        println!("State:       {}", stats.state);
        println!("Units:       {}", stats.unit_count);
        match &stats.schema_version {
            Some(version) => println!("Schema:      {}", version),
            None => println!("Schema:      (none)"),
        }
        println!("Store size:  {} bytes", stats.store_size_bytes);
        println!("Index:       {}", kb.index_path().display());

        if let Some(mismatch) = kb.stale_reason() {
            println!("\n{}", mismatch);
            println!("Run 'repowiki build --force' to rebuild.");
        }

        Ok(())
    }
}
