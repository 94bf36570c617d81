//! Embedding configuration types.

use serde::{Deserialize, Serialize};

/// Embedding configuration for a knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name: "trigram", "ollama", "openai"
    pub provider: String,

    /// Model identifier (provider-specific)
    pub model: String,

    /// Embedding vector dimensions
    pub dimensions: usize,

    /// Endpoint override for network providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "trigram".to_string(),
            model: "trigram-v1".to_string(),
            dimensions: 384,
            endpoint: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            dimensions,
            endpoint: None,
        }
    }

    /// Conventional settings for a provider/model pair.
    ///
    /// Known hosted models get their native dimension; anything else keeps
    /// the dimension already configured.
    pub fn for_provider(provider: &str, model: &str) -> Self {
        let dimensions = match (provider, model) {
            ("openai", "text-embedding-3-small") | ("openai", "text-embedding-ada-002") => 1536,
            ("openai", "text-embedding-3-large") => 3072,
            ("ollama", "nomic-embed-text") => 768,
            ("ollama", "mxbai-embed-large") => 1024,
            ("ollama", "all-minilm") => 384,
            _ => Self::default().dimensions,
        };

        Self::new(provider, model, dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmbeddingConfig::default();
        assert_eq!(config.provider, "trigram");
        assert_eq!(config.model, "trigram-v1");
        assert_eq!(config.dimensions, 384);
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_known_model_dimensions() {
        assert_eq!(
            EmbeddingConfig::for_provider("openai", "text-embedding-3-small").dimensions,
            1536
        );
        assert_eq!(
            EmbeddingConfig::for_provider("ollama", "nomic-embed-text").dimensions,
            768
        );
        assert_eq!(
            EmbeddingConfig::for_provider("trigram", "trigram-v1").dimensions,
            384
        );
    }

    #[test]
    fn test_yaml_round_trip_omits_endpoint() {
        let yaml = serde_yaml::to_string(&EmbeddingConfig::default()).unwrap();
        assert!(!yaml.contains("endpoint"));
        let parsed: EmbeddingConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, EmbeddingConfig::default());
    }
}
