//! Prompt types for Repowiki.
//!
//! This module defines the domain entities for the prompt system.

use serde::{Deserialize, Serialize};

/// A prompt definition loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    /// Unique prompt identifier
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// API version for schema evolution
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Behavioral settings
    #[serde(default)]
    pub behavior: PromptBehavior,

    /// System message template (Handlebars)
    #[serde(default)]
    pub system: Option<String>,

    /// User message template (Handlebars)
    pub template: String,
}

/// Behavioral settings for prompt execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBehavior {
    /// Sampling temperature passed to the model
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Upper bound on generated tokens
    #[serde(rename = "maxTokens", default)]
    pub max_tokens: Option<u32>,
}

impl Default for PromptBehavior {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: None,
        }
    }
}

/// One earlier exchange rendered into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTurn {
    pub question: String,
    pub answer: String,
}

/// One retrieved excerpt rendered into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptSource {
    /// Citation tag, `path:start-end`
    pub tag: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl PromptSource {
    pub fn new(
        path: impl Into<String>,
        start_line: usize,
        end_line: usize,
        text: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            tag: format!("{}:{}-{}", path, start_line, end_line),
            path,
            start_line,
            end_line,
            text: text.into(),
        }
    }
}

/// Everything an answer template can reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerContext {
    /// Repository identity
    pub repository: String,

    /// The current question
    pub question: String,

    /// Earlier turns, oldest first
    pub history: Vec<PromptTurn>,

    /// Retrieved excerpts, best first
    pub sources: Vec<PromptSource>,
}

/// A fully built prompt ready for LLM execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltPrompt {
    /// System message (optional)
    pub system: Option<String>,

    /// User message (required)
    pub user: String,

    /// Metadata about the built prompt
    pub metadata: BuiltPromptMetadata,
}

/// Metadata about a built prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltPromptMetadata {
    /// Source prompt ID
    #[serde(rename = "sourcePromptId")]
    pub source_prompt_id: String,

    /// Number of excerpts included
    #[serde(rename = "sourceCount")]
    pub source_count: usize,

    /// Number of history turns included
    #[serde(rename = "historyTurns")]
    pub history_turns: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}
