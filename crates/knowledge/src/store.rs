//! SQLite persistence for embedding indexes.
//!
//! Layout of `index.sqlite`:
//!
//! ```text
//! schema_version(format_version, embedding_model, dimension, built_at)
//! units(ordinal, path, start_line, end_line, text, hash, vector)
//! ```
//!
//! Vectors are stored as little-endian `f32` blobs. The version row is read
//! and checked before anything in `units` is touched.

use crate::guard;
use crate::index::{EmbeddingIndex, IndexEntry};
use crate::types::Unit;
use chrono::{DateTime, Utc};
use repowiki_core::{AppError, AppResult, SchemaVersion};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
    CREATE TABLE schema_version (
        format_version INTEGER NOT NULL,
        embedding_model TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        built_at TEXT NOT NULL
    );

    CREATE TABLE units (
        ordinal INTEGER PRIMARY KEY,
        path TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        vector BLOB NOT NULL
    );
"#;

/// Persist an index atomically.
///
/// The store is written to a temporary file next to `path` in a single
/// transaction, synced, then renamed over `path`. Readers see either the old
/// store or the complete new one.
pub fn save(index: &EmbeddingIndex, path: &Path) -> AppResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Storage(format!("Index path {:?} has no parent", path)))?;
    fs::create_dir_all(dir)?;

    let temp = tempfile::Builder::new()
        .prefix(".index-")
        .suffix(".sqlite.tmp")
        .tempfile_in(dir)?;

    write_store(index, temp.path())?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        AppError::Storage(format!("Failed to move index into place at {:?}: {}", path, e.error))
    })?;
    sync_dir(dir);

    tracing::info!(
        "Saved index with {} units to {:?} ({})",
        index.len(),
        path,
        index.version()
    );
    Ok(())
}

fn write_store(index: &EmbeddingIndex, path: &Path) -> AppResult<()> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;

    tx.execute_batch(SCHEMA)?;

    let version = index.version();
    tx.execute(
        "INSERT INTO schema_version (format_version, embedding_model, dimension, built_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            version.format_version,
            version.embedding_model,
            version.dimension as i64,
            version.built_at.to_rfc3339(),
        ],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO units (ordinal, path, start_line, end_line, text, hash, vector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for (ordinal, entry) in index.entries().iter().enumerate() {
            let unit = &entry.unit;
            stmt.execute(params![
                ordinal as i64,
                unit.path,
                unit.start_line as i64,
                unit.end_line as i64,
                unit.text,
                unit.hash,
                vector_to_bytes(&entry.vector),
            ])?;
        }
    }

    tx.commit()?;
    conn.close().map_err(|(_, e)| AppError::from(e))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!("Could not sync directory {:?}: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Load an index, failing with a schema mismatch unless its version matches
/// `expected` exactly.
pub fn load(path: &Path, expected: &SchemaVersion) -> AppResult<EmbeddingIndex> {
    if !path.exists() {
        return Err(AppError::NotReady(format!("no index at {:?}", path)));
    }

    let conn = open_read_only(path)?;

    let stored = match read_version_from(&conn)? {
        Some(stored) => stored,
        None => return Err(guard::missing(expected).into()),
    };
    guard::check(&stored, expected)?;

    let mut stmt = conn.prepare(
        "SELECT path, start_line, end_line, text, hash, vector FROM units ORDER BY ordinal",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            Unit {
                path: row.get(0)?,
                start_line: row.get::<_, i64>(1)? as usize,
                end_line: row.get::<_, i64>(2)? as usize,
                text: row.get(3)?,
                hash: row.get(4)?,
            },
            row.get::<_, Vec<u8>>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (unit, bytes) = row?;
        let vector = bytes_to_vector(&bytes, stored.dimension).ok_or_else(|| {
            AppError::Storage(format!(
                "corrupt index: vector for {} is {} bytes, expected {} floats",
                unit.tag(),
                bytes.len(),
                stored.dimension
            ))
        })?;
        entries.push(IndexEntry { unit, vector });
    }

    tracing::debug!("Loaded {} units from {:?}", entries.len(), path);
    EmbeddingIndex::new(stored, entries)
}

/// Read only the version record of a store.
///
/// `Ok(None)` when the store exists but has no version record.
pub fn read_version(path: &Path) -> AppResult<Option<SchemaVersion>> {
    if !path.exists() {
        return Err(AppError::NotReady(format!("no index at {:?}", path)));
    }

    read_version_from(&open_read_only(path)?)
}

fn open_read_only(path: &Path) -> AppResult<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| AppError::Storage(format!("Failed to open index at {:?}: {}", path, e)))
}

fn read_version_from(conn: &Connection) -> AppResult<Option<SchemaVersion>> {
    let has_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;

    if has_table == 0 {
        return Ok(None);
    }

    let row = conn
        .query_row(
            "SELECT format_version, embedding_model, dimension, built_at FROM schema_version LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((format_version, embedding_model, dimension, built_at)) = row else {
        return Ok(None);
    };

    let built_at = DateTime::parse_from_rfc3339(&built_at)
        .map_err(|e| AppError::Storage(format!("Invalid build timestamp '{}': {}", built_at, e)))?
        .with_timezone(&Utc);

    Ok(Some(SchemaVersion {
        format_version,
        embedding_model,
        dimension: dimension as usize,
        built_at,
    }))
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_vector(bytes: &[u8], dimension: usize) -> Option<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::content_hash;
    use crate::guard::CURRENT_FORMAT_VERSION;
    use tempfile::TempDir;

    fn version(model: &str, dimension: usize) -> SchemaVersion {
        SchemaVersion {
            format_version: CURRENT_FORMAT_VERSION,
            embedding_model: model.to_string(),
            dimension,
            built_at: Utc::now(),
        }
    }

    fn sample_index() -> EmbeddingIndex {
        let entries = ["def a():", "def b():"]
            .iter()
            .enumerate()
            .map(|(i, text)| IndexEntry {
                unit: Unit {
                    path: format!("pkg/{}.py", i),
                    start_line: 1,
                    end_line: 1,
                    text: text.to_string(),
                    hash: content_hash(text),
                },
                vector: vec![i as f32, 0.5, -1.25],
            })
            .collect();

        EmbeddingIndex::new(version("trigram/trigram-v1", 3), entries).unwrap()
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bases").join("repo").join("index.sqlite");
        let index = sample_index();

        save(&index, &path).unwrap();
        let loaded = load(&path, index.version()).unwrap();

        assert_eq!(loaded, index);
        assert_eq!(
            loaded.version().built_at.timestamp(),
            index.version().built_at.timestamp()
        );
    }

    #[test]
    fn test_save_leaves_no_temporary_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");

        save(&sample_index(), &path).unwrap();
        save(&sample_index(), &path).unwrap();

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["index.sqlite".to_string()]);
    }

    #[test]
    fn test_load_missing_store_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let result = load(&temp.path().join("index.sqlite"), &version("m", 3));
        assert!(matches!(result, Err(AppError::NotReady(_))));
    }

    #[test]
    fn test_load_with_different_model_is_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");
        save(&sample_index(), &path).unwrap();

        let err = load(&path, &version("ollama/nomic-embed-text", 3)).unwrap_err();
        let mismatch = err.as_schema_mismatch().unwrap();
        assert_eq!(
            mismatch.stored.as_ref().unwrap().embedding_model,
            "trigram/trigram-v1"
        );
        assert_eq!(mismatch.expected.embedding_model, "ollama/nomic-embed-text");

        let err = load(&path, &version("trigram/trigram-v1", 384)).unwrap_err();
        assert!(err.as_schema_mismatch().is_some());
    }

    #[test]
    fn test_store_without_version_record_is_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");

        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE units (ordinal INTEGER, text TEXT);")
            .unwrap();
        drop(conn);

        let err = load(&path, &version("trigram/trigram-v1", 3)).unwrap_err();
        assert!(err.as_schema_mismatch().unwrap().stored.is_none());
        assert!(read_version(&path).unwrap().is_none());
    }

    #[test]
    fn test_truncated_vector_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");
        save(&sample_index(), &path).unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE units SET vector = ?1 WHERE ordinal = 1", params![vec![0u8; 8]])
            .unwrap();
        drop(conn);

        let result = load(&path, &version("trigram/trigram-v1", 3));
        assert!(matches!(result, Err(AppError::Storage(_))));
    }

    #[test]
    fn test_read_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");
        save(&sample_index(), &path).unwrap();

        let stored = read_version(&path).unwrap().unwrap();
        assert_eq!(stored.dimension, 3);
        assert_eq!(stored.format_version, CURRENT_FORMAT_VERSION);
    }
}
