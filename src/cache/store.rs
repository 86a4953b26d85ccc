//! On-disk storage for a cached resource.
//!
//! Two sibling files per resource: the raw body as last fetched, and a small
//! JSON metadata document:
//!
//! ```json
//! {"updateAfter":"2026-01-07T15:32:01Z","version":"42"}
//! ```
//!
//! Both are replaced wholesale through a temporary file in the same
//! directory, so a reader never observes a half-written file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::CacheError;

/// When to refresh next, and which version the stored body carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMetadata {
    /// Earliest time of the next fetch.
    #[serde(rename = "updateAfter")]
    pub update_after: DateTime<Utc>,
    /// Application-level version token of the stored body.
    pub version: String,
}

impl RefreshMetadata {
    /// Create metadata for the given due time and version token.
    pub fn new(update_after: DateTime<Utc>, version: impl Into<String>) -> Self {
        Self {
            update_after,
            version: version.into(),
        }
    }
}

/// Content and metadata files of one cached resource.
#[derive(Debug, Clone)]
pub struct CacheStore {
    content_path: PathBuf,
    meta_path: PathBuf,
}

impl CacheStore {
    /// Create a store over the given content and metadata files.
    pub fn new(content_path: impl Into<PathBuf>, meta_path: impl Into<PathBuf>) -> Self {
        Self {
            content_path: content_path.into(),
            meta_path: meta_path.into(),
        }
    }

    /// Path of the content file.
    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    /// Path of the metadata file.
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Create parent directories and empty files if they are missing.
    ///
    /// Existing files are left untouched.
    pub fn ensure(&self) -> Result<(), CacheError> {
        for path in [&self.content_path, &self.meta_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| CacheError::storage(parent, e))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CacheError::storage(path, e))?;
        }
        debug!("Cache storage ready at {:?}", self.content_path);
        Ok(())
    }

    /// Read the stored body. An empty string means nothing was stored yet.
    pub fn load_content(&self) -> Result<String, CacheError> {
        fs::read_to_string(&self.content_path)
            .map_err(|e| CacheError::storage(&self.content_path, e))
    }

    /// Read the stored metadata, `None` when the file is empty.
    pub fn load_meta(&self) -> Result<Option<RefreshMetadata>, CacheError> {
        let raw = fs::read_to_string(&self.meta_path)
            .map_err(|e| CacheError::storage(&self.meta_path, e))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CacheError::CorruptMetadata {
                path: self.meta_path.clone(),
                source,
            })
    }

    /// Replace the stored body.
    pub fn write_content(&self, content: &str) -> Result<(), CacheError> {
        replace_file(&self.content_path, content.as_bytes())
    }

    /// Replace the stored metadata.
    pub fn write_meta(&self, meta: &RefreshMetadata) -> Result<(), CacheError> {
        let json = serde_json::to_vec(meta)?;
        replace_file(&self.meta_path, &json)
    }
}

/// Write `contents` to a temp file next to `path`, then rename it over `path`.
fn replace_file(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::storage(dir, e))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| CacheError::storage(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CacheError::storage(path, e.error))?;
    Ok(())
}
