//! Provider identification.

/// Provider type enum for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    OpenAI,
    Ollama,
    Echo,
}

impl ProviderType {
    /// Parse provider type from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "ollama" => Some(Self::Ollama),
            "echo" | "offline" => Some(Self::Echo),
            _ => None,
        }
    }

    /// Get the canonical provider name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
            Self::Echo => "echo",
        }
    }

    /// Default endpoint for network providers.
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("https://api.openai.com"),
            Self::Ollama => Some("http://localhost:11434"),
            Self::Echo => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!(ProviderType::parse("openai"), Some(ProviderType::OpenAI));
        assert_eq!(ProviderType::parse("Ollama"), Some(ProviderType::Ollama));
        assert_eq!(ProviderType::parse("offline"), Some(ProviderType::Echo));
        assert_eq!(ProviderType::parse("claude"), None);
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            ProviderType::Ollama.default_endpoint(),
            Some("http://localhost:11434")
        );
        assert_eq!(ProviderType::Echo.default_endpoint(), None);
    }
}
