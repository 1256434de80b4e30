//! Hash-differential project sync.
//!
//! "Upload only what changed": hash the local project tree, ask the device
//! for its hashes of the same paths, and transfer the difference. The
//! local/remote hash maps live on a transient [`ProjectSync`] context built
//! per invocation; nothing survives between uploads.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use walkdir::WalkDir;

use crate::ops::{ProgressFn, Status};
use crate::session::Session;

/// File selection for a project upload.
#[derive(Debug, Clone, Default)]
pub struct ProjectSyncOptions {
    /// Extensions to include (with or without leading dot). Empty means
    /// everything.
    pub file_types: Vec<String>,
    /// Path fragments to exclude: an entry matches a path component, the
    /// whole relative path, or a leading directory of it.
    pub ignored: Vec<String>,
}

/// Transient state of one calc-hashes → upload chain.
#[derive(Debug)]
struct ProjectSync {
    local_hashes: BTreeMap<String, String>,
    remote_hashes: HashMap<String, String>,
}

impl ProjectSync {
    /// Relative paths whose remote hash is absent or different.
    fn files_to_upload(&self) -> Vec<String> {
        diff_hashes(&self.local_hashes, &self.remote_hashes)
    }
}

/// Every local path whose remote entry is absent or differs.
pub fn diff_hashes(
    local: &BTreeMap<String, String>,
    remote: &HashMap<String, String>,
) -> Vec<String> {
    local
        .iter()
        .filter(|(path, hash)| remote.get(*path) != Some(*hash))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Scan `root`, returning relative forward-slash paths mapped to SHA-256
/// hex digests of their contents.
pub fn scan_local_hashes(
    root: &Path,
    options: &ProjectSyncOptions,
) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = normalize_remote_path(&relative.to_string_lossy());
        if is_ignored(&relative, &options.ignored) || !type_allowed(&relative, &options.file_types)
        {
            continue;
        }
        let contents = std::fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        hashes.insert(relative, format!("{:x}", hasher.finalize()));
    }
    Ok(hashes)
}

/// Rewrite backslashes and doubled slashes to single forward slashes so
/// remote paths are device-shaped regardless of the host platform.
pub fn normalize_remote_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}

fn is_ignored(relative: &str, ignored: &[String]) -> bool {
    ignored.iter().any(|entry| {
        let entry = entry.trim_matches('/');
        relative == entry
            || relative.starts_with(&format!("{entry}/"))
            || relative.split('/').any(|component| component == entry)
    })
}

fn type_allowed(relative: &str, file_types: &[String]) -> bool {
    if file_types.is_empty() {
        return true;
    }
    let Some(extension) = relative.rsplit('.').next().filter(|ext| *ext != relative) else {
        return false;
    };
    file_types
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(extension))
}

impl Session {
    /// Upload the files of `root` that differ from the device copy.
    ///
    /// Resolves `None` when the session is down, the scan fails, or nothing
    /// needs uploading.
    pub async fn upload_project(
        &self,
        root: &Path,
        options: &ProjectSyncOptions,
        follow: Option<ProgressFn>,
    ) -> Option<Status> {
        let local_hashes = match scan_local_hashes(root, options) {
            Ok(hashes) => hashes,
            Err(err) => {
                tracing::warn!(%err, root = %root.display(), "project scan failed");
                return None;
            }
        };
        let relative_paths: Vec<String> = local_hashes.keys().cloned().collect();
        let remote = self.calc_file_hashes(&relative_paths).await?;
        let sync = ProjectSync {
            local_hashes,
            remote_hashes: remote.hashes,
        };

        let to_upload: Vec<String> = sync
            .files_to_upload()
            .into_iter()
            .map(|relative| root.join(relative).to_string_lossy().into_owned())
            .collect();
        if to_upload.is_empty() {
            tracing::debug!("project is in sync; nothing to upload");
            return None;
        }
        tracing::debug!(count = to_upload.len(), "uploading changed project files");
        self.upload_files(&to_upload, ":", Some(root), follow).await
    }

    /// Download the whole device filesystem below `dest`.
    ///
    /// The helper treats a single-file local target literally, so with
    /// exactly one remote file the target is `dest` + that path.
    pub async fn download_project(
        &self,
        dest: &Path,
        follow: Option<ProgressFn>,
    ) -> Option<Status> {
        let listing = self.list_contents_recursive("/").await?;
        let files: Vec<String> = listing
            .files
            .iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.path.clone())
            .collect();
        if files.is_empty() {
            tracing::debug!("device filesystem is empty; nothing to download");
            return None;
        }
        let dest = dest.to_string_lossy().into_owned();
        let local = if files.len() == 1 {
            let first = files[0].trim_start_matches(':');
            if first.starts_with('/') {
                format!("{}{}", dest.trim_end_matches('/'), first)
            } else {
                format!("{}/{}", dest.trim_end_matches('/'), first)
            }
        } else {
            dest
        };
        self.download_files(&files, &local, follow).await
    }
}
