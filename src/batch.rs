//! Batch submission requests.
//!
//! A [`Batch`] is the declarative "download these N files as one unit"
//! request handed to [`DownloadManager::submit`](crate::DownloadManager::submit).
//! It is validated once at submission; the engine then tracks it as a
//! [`DownloadBatch`](crate::DownloadBatch).

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque, globally unique batch identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Creates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one file within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file of a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFile {
    /// Identity within the batch.
    pub id: FileId,
    /// Source URI.
    pub uri: String,
    /// Destination path relative to the batch's storage directory.
    pub relative_path: PathBuf,
}

/// A request to download a group of files as one logical unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    title: String,
    files: Vec<BatchFile>,
}

impl Batch {
    /// Starts building a batch with a caller-supplied id.
    #[must_use]
    pub fn with(id: impl Into<BatchId>, title: impl Into<String>) -> BatchBuilder {
        BatchBuilder {
            id: id.into(),
            title: title.into(),
            files: Vec::new(),
        }
    }

    /// Starts building a batch with a generated id.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> BatchBuilder {
        Self::with(BatchId::generate(), title)
    }

    #[must_use]
    pub const fn id(&self) -> &BatchId {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn files(&self) -> &[BatchFile] {
        &self.files
    }

    /// Checks the request: a usable id, at least one file, parseable URIs,
    /// unique file ids, and relative destination paths that stay inside the
    /// batch directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !is_safe_id(self.id.as_str()) {
            return Err(Error::InvalidRequest(format!(
                "batch id {:?} cannot be used as a directory name",
                self.id.as_str()
            )));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "batch {} has no files",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for file in &self.files {
            let url = reqwest::Url::parse(&file.uri).map_err(|e| {
                Error::InvalidRequest(format!("invalid uri {:?}: {e}", file.uri))
            })?;
            if url.cannot_be_a_base() {
                return Err(Error::InvalidRequest(format!(
                    "uri {:?} has no path",
                    file.uri
                )));
            }
            if !ids.insert(&file.id) {
                return Err(Error::InvalidRequest(format!(
                    "duplicate file id {} in batch {}",
                    file.id, self.id
                )));
            }
            if !is_contained(&file.relative_path) {
                return Err(Error::InvalidRequest(format!(
                    "destination {} escapes the batch directory",
                    file.relative_path.display()
                )));
            }
            if !paths.insert(&file.relative_path) {
                return Err(Error::InvalidRequest(format!(
                    "duplicate destination {} in batch {}",
                    file.relative_path.display(),
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Builder returned by [`Batch::with`] and [`Batch::titled`].
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    id: BatchId,
    title: String,
    files: Vec<BatchFile>,
}

impl BatchBuilder {
    /// Adds a file whose destination is derived from the URI.
    #[must_use]
    pub fn add_file(self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let id = FileId::from(self.files.len().to_string());
        let relative_path = default_relative_path(&uri, &id);
        self.push(BatchFile {
            id,
            uri,
            relative_path,
        })
    }

    /// Adds a file saved under an explicit relative path.
    #[must_use]
    pub fn add_file_at(self, uri: impl Into<String>, relative_path: impl Into<PathBuf>) -> Self {
        let id = FileId::from(self.files.len().to_string());
        self.push(BatchFile {
            id,
            uri: uri.into(),
            relative_path: relative_path.into(),
        })
    }

    /// Adds a fully specified file entry.
    #[must_use]
    pub fn push(mut self, file: BatchFile) -> Self {
        self.files.push(file);
        self
    }

    #[must_use]
    pub fn build(self) -> Batch {
        Batch {
            id: self.id,
            title: self.title,
            files: self.files,
        }
    }
}

/// Last non-empty path segment of the URI, falling back to the file id.
fn default_relative_path(uri: &str, id: &FileId) -> PathBuf {
    reqwest::Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .filter(|name| name != "." && name != "..")
        .map_or_else(|| PathBuf::from(id.as_str()), PathBuf::from)
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
