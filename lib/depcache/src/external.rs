//! On-disk storage for external columns.
//!
//! Each table owns `extern_<table>/` under the cache root. A blob's file name
//! embeds the table name, the row's parent rowids and the config hash:
//!
//! ```text
//! extern_thumbnails/thumbnails_id=1_<config hash>.png
//! extern_matches/matches_id=4_17_<config hash>.json
//! ```
//!
//! so two rows can only share a file name if they share a superkey. Files are
//! written once through a temporary file and an atomic no-clobber rename;
//! readers never see partial blobs and a stored blob is never replaced.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{DepcacheError, RowId};

/// Blob directory layout rooted at the cache directory.
#[derive(Debug, Clone)]
pub struct ExternalStore {
    cache_root: PathBuf,
}

impl ExternalStore {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Directory name for a table's blobs, relative to the cache root.
    pub fn dir_name(table: &str) -> String {
        format!("extern_{}", table)
    }

    /// File name for one row's blob.
    pub fn file_name(
        table: &str,
        parent_rowids: &[RowId],
        config_hashid: &str,
        extension: &str,
    ) -> String {
        let rowids: Vec<String> = parent_rowids.iter().map(|id| id.to_string()).collect();
        format!(
            "{}_id={}_{}{}",
            table,
            rowids.join("_"),
            config_hashid,
            extension
        )
    }

    /// Reference stored in the row: `extern_<table>/<file name>`.
    pub fn reference(
        table: &str,
        parent_rowids: &[RowId],
        config_hashid: &str,
        extension: &str,
    ) -> String {
        format!(
            "{}/{}",
            Self::dir_name(table),
            Self::file_name(table, parent_rowids, config_hashid, extension)
        )
    }

    /// Absolute path of a stored reference.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        reference
            .split('/')
            .fold(self.cache_root.clone(), |path, part| path.join(part))
    }

    pub fn ensure_dir(&self, table: &str) -> Result<PathBuf, DepcacheError> {
        let dir = self.cache_root.join(Self::dir_name(table));
        fs::create_dir_all(&dir).map_err(|e| io_error(table, &dir, e))?;
        Ok(dir)
    }

    /// Write `bytes` to `reference` unless a file is already there.
    ///
    /// Returns `false` when an existing file was kept. File names are unique
    /// per superkey, so an existing file belongs to a row for the same
    /// superkey, possibly inserted by a concurrent writer.
    pub fn write(&self, table: &str, reference: &str, bytes: &[u8]) -> Result<bool, DepcacheError> {
        let path = self.resolve(reference);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cache_root.clone());

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_error(table, &path, e))?;
        tmp.write_all(bytes).map_err(|e| io_error(table, &path, e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(table, &path, e))?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error(table, &path, e.error)),
        }
    }

    /// Read a blob. A missing file is an error: every stored reference was
    /// written before its row was inserted.
    pub fn read(&self, table: &str, reference: &str) -> Result<Vec<u8>, DepcacheError> {
        let path = self.resolve(reference);
        fs::read(&path).map_err(|e| io_error(table, &path, e))
    }

    /// Remove a blob; returns whether a file was removed.
    pub fn remove(&self, table: &str, reference: &str) -> Result<bool, DepcacheError> {
        let path = self.resolve(reference);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(table, &path, e)),
        }
    }
}

fn io_error(table: &str, path: &Path, e: std::io::Error) -> DepcacheError {
    DepcacheError::ExternalIo {
        table: table.to_string(),
        path: path.to_path_buf(),
        source: Box::new(e),
    }
}
