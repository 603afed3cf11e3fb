//! Pull gallery and probe images out of the object store onto local disk.

use crate::object::{ObjectStore, ObjectStoreError};
use std::path::{Path, PathBuf};

/// How object keys map to local paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Keep the key path below the prefix: `known/alice/1.jpg` → `alice/1.jpg`.
    Preserve,
    /// Keep only the file name: `uploads/x/1.jpg` → `1.jpg`.
    Flatten,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub downloaded: usize,
    pub failed: usize,
}

fn local_path(key: &str, prefix: &str, layout: Layout, local_dir: &Path) -> Option<PathBuf> {
    let rel = match layout {
        Layout::Preserve => key.strip_prefix(prefix).unwrap_or(key),
        Layout::Flatten => key.rsplit('/').next().unwrap_or(key),
    };
    let mut path = local_dir.to_path_buf();
    for part in rel.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => path.push(part),
        }
    }
    (path != local_dir).then_some(path)
}

/// Download every object under `bucket/prefix` into `local_dir`.
///
/// Folder placeholder keys (ending in `/`) are skipped. A failed download is
/// logged and counted; only a failed listing aborts.
pub fn stage_prefix(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    local_dir: &Path,
    layout: Layout,
) -> Result<StageReport, ObjectStoreError> {
    std::fs::create_dir_all(local_dir).map_err(|source| ObjectStoreError::Io {
        path: local_dir.to_path_buf(),
        source,
    })?;

    let keys = store.list_objects(bucket, prefix)?;
    if keys.is_empty() {
        tracing::warn!(bucket, prefix, "no objects found");
    }

    let mut report = StageReport::default();
    for key in keys.iter().filter(|k| !k.ends_with('/')) {
        let Some(dest) = local_path(key, prefix, layout, local_dir) else {
            tracing::warn!(key = %key, "skipping object with unusable key");
            report.failed += 1;
            continue;
        };
        match store.download_file(bucket, key, &dest) {
            Ok(()) => {
                tracing::info!(key = %key, local = %dest.display(), "downloaded");
                report.downloaded += 1;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "download failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
