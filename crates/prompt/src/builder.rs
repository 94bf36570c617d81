//! Prompt builder for rendering templates with answer context.

use crate::types::{AnswerContext, BuiltPrompt, BuiltPromptMetadata, PromptDefinition};
use handlebars::Handlebars;
use repowiki_core::{AppError, AppResult};
use serde::Serialize;

/// Build a prompt from a definition and the retrieval context.
///
/// Both the system and user templates see the same data: `repository`,
/// `question`, `history` (oldest first) and `sources` (best first).
///
/// # Example
/// ```no_run
/// use repowiki_prompt::{build_prompt, builtin_answer_prompt, AnswerContext};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let def = builtin_answer_prompt()?;
/// let context = AnswerContext {
///     repository: "repowiki".to_string(),
///     question: "Where is the chunker?".to_string(),
///     ..Default::default()
/// };
/// let built = build_prompt(&def, &context)?;
/// println!("User prompt: {}", built.user);
/// # Ok(())
/// # }
/// ```
pub fn build_prompt(
    definition: &PromptDefinition,
    context: &AnswerContext,
) -> AppResult<BuiltPrompt> {
    tracing::debug!(
        "Building prompt {} with {} sources, {} history turns",
        definition.id,
        context.sources.len(),
        context.history.len()
    );

    let system = definition
        .system
        .as_deref()
        .map(|template| render_template(template, context))
        .transpose()?
        .map(|s| s.trim_end().to_string());

    let user = render_template(&definition.template, context)?;

    Ok(BuiltPrompt {
        system,
        user,
        metadata: BuiltPromptMetadata {
            source_prompt_id: definition.id.clone(),
            source_count: context.sources.len(),
            history_turns: context.history.len(),
            temperature: definition.behavior.temperature,
            max_tokens: definition.behavior.max_tokens,
        },
    })
}

/// Render a Handlebars template with serializable data.
pub fn render_template<T: Serialize>(template: &str, data: &T) -> AppResult<String> {
    let mut handlebars = Handlebars::new();

    // Disable HTML escaping for plain text
    handlebars.register_escape_fn(handlebars::no_escape);

    handlebars
        .register_template_string("prompt", template)
        .map_err(|e| AppError::Prompt(format!("Failed to register template: {}", e)))?;

    handlebars
        .render("prompt", data)
        .map_err(|e| AppError::Prompt(format!("Failed to render template: {}", e)))
}
