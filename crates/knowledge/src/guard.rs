//! Schema version checks for persisted indexes.
//!
//! A stored index is only usable when its format version, embedding model and
//! dimension all match what the running configuration would produce. Anything
//! else is a [`SchemaMismatch`]; there is no migration path.

use crate::embeddings::{model_id, EmbeddingProvider};
use chrono::Utc;
use repowiki_core::{SchemaMismatch, SchemaVersion};

/// On-disk layout version written by this build of the store.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Compare a loaded version against the expected one.
pub fn check(loaded: &SchemaVersion, expected: &SchemaVersion) -> Result<(), SchemaMismatch> {
    if loaded.is_compatible_with(expected) {
        return Ok(());
    }

    tracing::warn!("Schema mismatch: stored ({}), expected ({})", loaded, expected);

    Err(SchemaMismatch {
        stored: Some(loaded.clone()),
        expected: expected.clone(),
    })
}

/// Mismatch for a store that carries no version record at all.
pub fn missing(expected: &SchemaVersion) -> SchemaMismatch {
    tracing::warn!("Index has no schema version record, expected ({})", expected);

    SchemaMismatch {
        stored: None,
        expected: expected.clone(),
    }
}

/// The version an index built now with `provider` would carry.
pub fn expected_version(provider: &dyn EmbeddingProvider) -> SchemaVersion {
    SchemaVersion {
        format_version: CURRENT_FORMAT_VERSION,
        embedding_model: model_id(provider),
        dimension: provider.dimensions(),
        built_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::providers::TrigramProvider;

    #[test]
    fn test_check_accepts_same_version_different_time() {
        let expected = expected_version(&TrigramProvider::new(384));
        let mut loaded = expected.clone();
        loaded.built_at = loaded.built_at - chrono::Duration::hours(5);

        assert!(check(&loaded, &expected).is_ok());
    }

    #[test]
    fn test_check_rejects_each_field() {
        let expected = expected_version(&TrigramProvider::new(384));

        let mut other_format = expected.clone();
        other_format.format_version = CURRENT_FORMAT_VERSION + 1;

        let mut other_model = expected.clone();
        other_model.embedding_model = "ollama/nomic-embed-text".to_string();

        let mut other_dimension = expected.clone();
        other_dimension.dimension = 768;

        for loaded in [other_format, other_model, other_dimension] {
            let mismatch = check(&loaded, &expected).unwrap_err();
            assert_eq!(mismatch.stored.as_ref(), Some(&loaded));
            assert_eq!(mismatch.expected, expected);
        }
    }

    #[test]
    fn test_expected_version_fields() {
        let version = expected_version(&TrigramProvider::new(128));
        assert_eq!(version.format_version, CURRENT_FORMAT_VERSION);
        assert_eq!(version.embedding_model, "trigram/trigram-v1");
        assert_eq!(version.dimension, 128);
        assert!(missing(&version).stored.is_none());
    }
}
