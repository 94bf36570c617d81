//! Prompt system for Repowiki.
//!
//! This crate provides structured prompt management with:
//! - YAML-based prompt definitions, overridable per workspace
//! - Handlebars template rendering
//! - Answer context injection (history and retrieved excerpts)

pub mod builder;
pub mod loader;
pub mod types;

// Re-export main types
pub use builder::{build_prompt, render_template};
pub use loader::{
    builtin_answer_prompt, list_prompts, load_prompt, resolve_prompt, DEFAULT_ANSWER_PROMPT_ID,
};
pub use types::{
    AnswerContext, BuiltPrompt, BuiltPromptMetadata, PromptBehavior, PromptDefinition,
    PromptSource, PromptTurn,
};
