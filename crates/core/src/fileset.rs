use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::{Error, Result};

pub const DEFAULT_PATTERN: &str = "*";

/// Ordered, read-only list of local files shared by every destination of a batch.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: Arc<[PathBuf]>,
}

impl FileSet {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files: files.into(),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.files.iter()
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Expands `pattern` inside `base` into regular files, in glob order.
///
/// A `base` that names a regular file resolves to that file alone.
pub fn resolve_files(base: &Path, pattern: &str) -> Result<FileSet> {
    let base = std::path::absolute(base).map_err(|e| Error::InvalidPath {
        path: base.to_path_buf(),
        message: format!("cannot resolve: {e}"),
    })?;
    let meta = std::fs::metadata(&base).map_err(|e| Error::InvalidPath {
        path: base.clone(),
        message: format!("not found: {e}"),
    })?;

    if meta.is_file() {
        return Ok(FileSet::new(vec![base]));
    }
    if !meta.is_dir() {
        return Err(Error::InvalidPath {
            path: base,
            message: "not a directory".to_string(),
        });
    }

    let base_str = base.to_str().ok_or_else(|| Error::InvalidPath {
        path: base.clone(),
        message: "path must be UTF-8".to_string(),
    })?;
    let pattern = match pattern.trim() {
        "" => DEFAULT_PATTERN,
        p => p,
    };
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(base_str.trim_end_matches('/')),
        pattern.trim_start_matches('/')
    );

    let paths = glob::glob(&full).map_err(|e| Error::InvalidPath {
        path: base.clone(),
        message: format!("invalid pattern {pattern:?}: {e}"),
    })?;

    let mut files = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| Error::InvalidPath {
            path: e.path().to_path_buf(),
            message: e.error().to_string(),
        })?;
        if path.is_dir() {
            tracing::debug!(event = "fileset.skip_dir", path = %path.display(), "fileset.skip_dir");
            continue;
        }
        files.push(path);
    }

    if files.is_empty() {
        return Err(Error::InvalidPath {
            path: base,
            message: format!("pattern {pattern:?} matched no files"),
        });
    }

    tracing::debug!(
        event = "fileset.resolved",
        files = files.len(),
        "fileset.resolved"
    );
    Ok(FileSet::new(files))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    /// Path relative to the walked root; empty for the root itself.
    pub relative: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct TreeWalk {
    pub entries: Vec<TreeEntry>,
    pub failures: Vec<WalkFailure>,
}

/// Walks `root` top-down: every directory precedes its contents.
///
/// Unreadable nodes are collected as failures instead of aborting the walk.
pub fn resolve_tree(root: &Path) -> Result<TreeWalk> {
    let root = std::path::absolute(root).map_err(|e| Error::InvalidPath {
        path: root.to_path_buf(),
        message: format!("cannot resolve: {e}"),
    })?;
    if !root.is_dir() {
        return Err(Error::InvalidPath {
            path: root,
            message: "not a directory".to_string(),
        });
    }

    let mut walk = TreeWalk::default();
    for entry in walkdir::WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                walk.failures.push(WalkFailure {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        let relative = entry
            .path()
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        walk.entries.push(TreeEntry {
            path: entry.into_path(),
            relative,
            kind,
        });
    }

    Ok(walk)
}
