//! Shared storage
//!
//! The peer list is written to, and the launch script read from, a filesystem
//! every node can see. [`SharedStorage`] is the narrow interface the master
//! needs from it; [`LocalStorage`] implements it on a mounted directory.

use crate::cluster::protocol::LocalResource;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Filesystem shared by the master and every worker
pub trait SharedStorage: Send + Sync {
    /// Absolute location of a storage-relative path
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Replace the file at `path` with `contents`, visible to readers only once
    /// fully written and synced
    fn write_durable(&self, path: &Path, contents: &str) -> Result<()>;

    /// Describe the file at `path` so a node manager can localize it
    fn local_resource(&self, path: &Path) -> Result<LocalResource>;
}

/// Shared storage backed by a mounted directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SharedStorage for LocalStorage {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn write_durable(&self, path: &Path, contents: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        // Write to a sibling temp file, then rename over the target
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid storage path: {}", target.display()))?;
        let tmp = target.with_file_name(format!(".{}.tmp", file_name));

        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &target)
            .with_context(|| format!("Failed to move {} into place", target.display()))?;
        Ok(())
    }

    fn local_resource(&self, path: &Path) -> Result<LocalResource> {
        let source = self.resolve(path);
        let metadata = fs::metadata(&source)
            .with_context(|| format!("Failed to stat {}", source.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", source.display());
        }
        let timestamp_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(LocalResource {
            source,
            size: metadata.len(),
            timestamp_ms,
        })
    }
}
