//! Answer types.

use crate::types::Provenance;
use serde::{Deserialize, Serialize};

/// Item of an answer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerEvent {
    /// Next piece of generated text
    Fragment(String),
}

/// A fully collected answer with the excerpts it was grounded on.
///
/// This is the non-streaming form used by scripts and `--json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// The question asked
    pub question: String,

    /// Generated answer text
    pub answer: String,

    /// Retrieved excerpts in rank order
    pub provenance: Vec<Provenance>,
}

impl Answer {
    /// Format provenance as `path:start-end (score)` lines.
    pub fn format_sources(&self) -> String {
        self.provenance
            .iter()
            .enumerate()
            .map(|(i, p)| {
                format!(
                    "{}. {}:{}-{} (score {:.3})",
                    i + 1,
                    p.path,
                    p.start_line,
                    p.end_line,
                    p.score
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
