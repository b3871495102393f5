//! Per-job scratch directories.
//!
//! Every job cycle gets its own directory tree under the configured workspace
//! root, named by a fresh token from [`new_id`]. The token is the only thing
//! keeping concurrent jobs apart, so it must stay unique across threads and
//! processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised by workspace filesystem operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to remove directory {path}: {source}")]
    RemoveDir { path: PathBuf, source: io::Error },

    #[error("Failed to write file {path}: {source}")]
    WriteFile { path: PathBuf, source: io::Error },
}

/// Generate a unique token for naming a workspace or stored object.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Create a directory and all missing ancestors. Existing directories are left untouched.
pub fn create_folder(path: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(path).map_err(|source| WorkspaceError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "Directory ready");
    Ok(())
}

/// Recursively remove a directory. A missing directory is not an error.
pub fn delete_folder(path: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Directory removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkspaceError::RemoveDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write bytes to a file, replacing any previous content.
pub fn write_file(path: &Path, data: &[u8]) -> Result<(), WorkspaceError> {
    fs::write(path, data).map_err(|source| WorkspaceError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Return the text after the last `.` of a name, or an empty string.
pub fn extension_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[idx + 1..],
        None => "",
    }
}

/// Job-scoped directory tree, removed when dropped.
///
/// ```text
/// {root}/{token}/
///   images/    extracted frames
///   video/     staged source video
/// ```
#[derive(Debug)]
pub struct Workspace {
    token: String,
    root: PathBuf,
    images_dir: PathBuf,
    video_dir: PathBuf,
    released: bool,
}

impl Workspace {
    /// Allocate a new workspace under `base` and create its directories.
    pub fn prepare(base: &Path) -> Result<Self, WorkspaceError> {
        let token = new_id();
        let root = base.join(&token);
        let images_dir = root.join("images");
        let video_dir = root.join("video");

        // Build the guard first so a partial failure below still cleans up
        let workspace = Self {
            token,
            root,
            images_dir,
            video_dir,
            released: false,
        };

        create_folder(&workspace.images_dir)?;
        create_folder(&workspace.video_dir)?;

        Ok(workspace)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    /// Write the source video into the staging directory.
    ///
    /// The file is named after the workspace token and keeps the source
    /// name's extension when it is plain alphanumeric.
    pub fn stage_video(&self, source_name: &str, data: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let base_name = source_name.rsplit(['/', '\\']).next().unwrap_or(source_name);
        let file_name = match extension_of(base_name) {
            ext if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
                format!("{}.{}", self.token, ext)
            }
            _ => self.token.clone(),
        };
        let path = self.video_dir.join(file_name);
        write_file(&path, data)?;
        Ok(path)
    }

    /// Remove the directory tree now and report the outcome.
    pub fn cleanup(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        delete_folder(&self.root)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = delete_folder(&self.root) {
            warn!(error = %e, token = %self.token, "Failed to remove workspace");
        }
    }
}
