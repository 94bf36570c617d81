//! Repository sources: where documents come from.

use crate::config::PathFilters;
use crate::types::{Document, SkippedFile};
use repowiki_core::{AppError, AppResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files larger than this are skipped.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Documents read from a repository plus the files that could not be read.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    /// Sorted by path
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedFile>,
}

/// A tree of files that can be ingested.
pub trait RepositorySource: Send + Sync {
    /// Stable identifier used to name the knowledge base.
    fn identity(&self) -> &str;

    /// Read every document that passes `filters`, in path order.
    ///
    /// Unreadable files are recorded in [`DocumentSet::skipped`]; only
    /// failures that affect the whole tree are returned as errors.
    fn documents(&self, filters: &PathFilters) -> AppResult<DocumentSet>;
}

/// A local directory.
#[derive(Debug, Clone)]
pub struct FsRepositorySource {
    root: PathBuf,
    identity: String,
    max_file_size: u64,
}

impl FsRepositorySource {
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(AppError::Ingestion(format!(
                "Repository root {:?} is not a directory",
                root
            )));
        }

        let identity = repository_identity(&root.to_string_lossy());
        Ok(Self {
            root,
            identity,
            max_file_size: MAX_FILE_SIZE,
        })
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RepositorySource for FsRepositorySource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn documents(&self, filters: &PathFilters) -> AppResult<DocumentSet> {
        let filters = filters.compile()?;
        let mut set = DocumentSet::default();

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !filters.is_excluded_dir(&relative_path(&self.root, entry.path()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| relative_path(&self.root, p))
                        .unwrap_or_default();
                    warn!("Skipping unreadable entry {}: {}", path, e);
                    set.skipped.push(SkippedFile {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = relative_path(&self.root, entry.path());
            if !filters.is_included(&relative) {
                continue;
            }

            match read_document(entry.path(), &relative, self.max_file_size) {
                Ok(document) => set.documents.push(document),
                Err(e) => {
                    warn!("Skipping {}: {}", relative, e);
                    set.skipped.push(SkippedFile {
                        path: relative,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Sort for deterministic ordering
        set.documents.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Read {} documents from {:?} ({} skipped)",
            set.documents.len(),
            self.root,
            set.skipped.len()
        );

        Ok(set)
    }
}

/// `/`-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn read_document(path: &Path, relative: &str, max_file_size: u64) -> AppResult<Document> {
    let size = fs::metadata(path)?.len();
    if size > max_file_size {
        return Err(AppError::Ingestion(format!(
            "file is {} bytes, limit is {}",
            size, max_file_size
        )));
    }

    let bytes = fs::read(path)?;
    if bytes.contains(&0) {
        return Err(AppError::Ingestion("binary file".to_string()));
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| AppError::Ingestion("not valid UTF-8".to_string()))?;

    Ok(Document {
        path: relative.to_string(),
        text,
        size,
    })
}

/// Identifier for a repository given as a local path or a remote URL.
///
/// A local directory is named after itself. A URL such as
/// `https://github.com/owner/repo.git` becomes `owner_repo`. Anything else
/// falls back to its last path segment.
pub fn repository_identity(url_or_path: &str) -> String {
    let path = Path::new(url_or_path);
    if path.is_dir() {
        let name = fs::canonicalize(path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
        if let Some(name) = name {
            return sanitize(&name);
        }
    }

    let remote_path = if let Some((_, rest)) = url_or_path.split_once("://") {
        // Drop the host
        rest.split_once('/').map(|(_, p)| p)
    } else if let Some(rest) = url_or_path.strip_prefix("git@") {
        rest.split_once(':').map(|(_, p)| p)
    } else {
        None
    };

    if let Some(remote_path) = remote_path {
        let parts: Vec<&str> = remote_path.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [owner, repo, ..] => {
                let repo = repo.strip_suffix(".git").unwrap_or(*repo);
                return sanitize(&format!("{}_{}", owner, repo));
            }
            [repo] => return sanitize(repo.strip_suffix(".git").unwrap_or(*repo)),
            [] => {}
        }
    }

    let last = url_or_path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    if last.is_empty() {
        "repository".to_string()
    } else {
        sanitize(last)
    }
}

/// Keep identities usable as directory names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
