//! Per-job temporary directories.
//!
//! Layout: `<root>/<job id>/incoming/` holds fetched streams, the job
//! directory itself holds the single output file. The whole job directory
//! is removed on every terminal transition, and the root is emptied on
//! startup to drop leftovers of a previous run.

use std::path::{Path, PathBuf};

use crate::download::model::JobId;
use crate::download::selection::StreamRole;

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    /// Creates (or reuses) the directory of `job` under `root`.
    pub async fn create(root: &Path, job: JobId) -> std::io::Result<Self> {
        let dir = root.join(job.to_string());
        fs_err::tokio::create_dir_all(dir.join("incoming")).await?;
        Ok(Self { dir })
    }

    /// Workspace of `job` without touching the filesystem.
    pub fn at(root: &Path, job: JobId) -> Self {
        Self {
            dir: root.join(job.to_string()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the fetched stream for `role` lands.
    pub fn input_path(&self, role: StreamRole, container: &str) -> PathBuf {
        self.dir.join("incoming").join(format!("{}.{}", role, container))
    }

    /// Removes the job directory. Idempotent.
    pub async fn purge(&self) {
        match fs_err::tokio::remove_dir_all(&self.dir).await {
            Ok(()) => log::debug!("Purged job directory {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to purge {}: {}", self.dir.display(), e),
        }
    }
}

/// Total size of all files below `dir` (0 if it doesn't exist).
pub async fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = fs_err::tokio::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => pending.push(entry.path()),
                Ok(_) => total += entry.metadata().await.map(|m| m.len()).unwrap_or(0),
                Err(_) => {}
            }
        }
    }
    total
}

/// Empties `root`, keeping the directory itself. Returns how many entries
/// were removed.
pub async fn purge_all(root: &Path) -> std::io::Result<usize> {
    fs_err::tokio::create_dir_all(root).await?;
    let mut removed = 0;
    let mut entries = fs_err::tokio::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            fs_err::tokio::remove_dir_all(&path).await
        } else {
            fs_err::tokio::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to remove stale temp entry {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        log::info!("Removed {} stale temp entr(ies) from {}", removed, root.display());
    }
    Ok(removed)
}
