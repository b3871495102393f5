use async_trait::async_trait;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Content type of produced archives
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Errors raised while building an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("No files to archive in {0}")]
    EmptySource(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    /// Whether retrying the same input could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Read { .. } | ArchiveError::Io(_) | ArchiveError::Task(_))
    }
}

/// Packs a directory into a single compressed buffer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive every regular file of `source_dir` as a flat entry.
    async fn compress(&self, source_dir: &Path) -> Result<Vec<u8>, ArchiveError>;
}

/// Deflate-compressed ZIP archiver
#[derive(Debug, Clone)]
pub struct ZipArchiver {
    level: i64,
}

impl ZipArchiver {
    pub fn new(level: i64) -> Self {
        Self { level }
    }
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self::new(9)
    }
}

#[async_trait]
impl Archiver for ZipArchiver {
    #[instrument(skip(self), fields(source_dir = %source_dir.display()))]
    async fn compress(&self, source_dir: &Path) -> Result<Vec<u8>, ArchiveError> {
        let source_dir = source_dir.to_path_buf();
        let level = self.level;

        let buffer = tokio::task::spawn_blocking(move || zip_directory(&source_dir, level))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        debug!(size_bytes = buffer.len(), "Archive built");
        Ok(buffer)
    }
}

/// Build a ZIP of the regular files directly inside `dir`, sorted by name
fn zip_directory(dir: &Path, level: i64) -> Result<Vec<u8>, ArchiveError> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArchiveError::Read { path, source }
    };

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err(dir))? {
        let entry = entry.map_err(read_err(dir))?;
        let path = entry.path();
        // Follows symlinks, so a dangling link is an error rather than a skipped entry
        if fs::metadata(&path).map_err(read_err(&path))?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }

    if files.is_empty() {
        return Err(ArchiveError::EmptySource(dir.to_path_buf()));
    }
    files.sort();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, path) in files {
        let data = fs::read(&path).map_err(|source| ArchiveError::Read { path, source })?;
        zip.start_file(name, options)?;
        zip.write_all(&data)?;
    }

    Ok(zip.finish()?.into_inner())
}
