//! Line-based chunking with a token budget and overlap.

use crate::types::{Document, Unit};
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

/// Estimate the token count of a piece of text.
///
/// Counts non-whitespace word-boundary segments, so identifiers, numbers and
/// each punctuation mark count as one token. Deterministic and cheap.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_word_bounds()
        .filter(|segment| !segment.trim().is_empty())
        .count()
}

/// SHA-256 of a unit's text, hex encoded.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Split a document into units of at most `max_tokens` estimated tokens.
///
/// Units always end at a line boundary. The last lines of a unit, up to
/// `overlap_tokens`, are repeated at the start of the next one. A single line
/// over budget becomes its own unit. Units made only of blank lines are
/// dropped.
pub fn chunk(document: &Document, max_tokens: usize, overlap_tokens: usize) -> Vec<Unit> {
    let lines: Vec<&str> = document.text.lines().collect();
    let costs: Vec<usize> = lines.iter().map(|line| estimate_tokens(line)).collect();

    let mut units = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        // The first line is always taken, even when it alone exceeds the budget
        let mut end = start + 1;
        let mut tokens = costs[start];
        while end < lines.len() && tokens + costs[end] <= max_tokens {
            tokens += costs[end];
            end += 1;
        }

        let slice = &lines[start..end];
        if slice.iter().any(|line| !line.trim().is_empty()) {
            let text = slice.join("\n");
            units.push(Unit {
                path: document.path.clone(),
                start_line: start + 1,
                end_line: end,
                hash: content_hash(&text),
                text,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Carry trailing lines forward, leaving room for the next new line
        let budget = overlap_tokens.min(max_tokens.saturating_sub(costs[end]));
        let mut next = end;
        let mut carried = 0;
        while next > start + 1 && carried + costs[next - 1] <= budget {
            carried += costs[next - 1];
            next -= 1;
        }

        start = next;
    }

    tracing::debug!(
        "Chunked {} into {} units (max_tokens: {}, overlap: {})",
        document.path,
        units.len(),
        max_tokens,
        overlap_tokens
    );

    units
}
