//! Snapshot publication.
//!
//! Fetched artifacts are staged next to their final location under a hidden
//! `.{name}.tmp` name, flushed to disk, then renamed over the published file.
//! Readers of `{mode}_{suffix}` therefore only ever see a complete old or a
//! complete new snapshot.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::modes::ArtifactKind;
use crate::services::feed_api::FetchResult;

const STAGING_SUFFIX: &str = ".tmp";

/// `{mode_key}_{suffix}`, e.g. `ferries_pos.pb`.
pub fn snapshot_file_name(mode_key: &str, kind: ArtifactKind) -> String {
    format!("{}_{}", mode_key, kind.suffix())
}

/// Hidden staging path for `(mode_key, kind)` inside `dir`.
pub fn staging_path(dir: &Path, mode_key: &str, kind: ArtifactKind) -> PathBuf {
    dir.join(format!(
        ".{}{}",
        snapshot_file_name(mode_key, kind),
        STAGING_SUFFIX
    ))
}

/// Writes `bytes` to `path` and syncs it to disk.
///
/// A partially written file is removed before the error is returned.
pub async fn stage_artifact(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(cleanup) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %cleanup, "Partial staging file not removed");
        }
        return Err(e);
    }
    Ok(())
}

/// Moves staged artifacts into their published location.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    output_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn target_path(&self, mode_key: &str, kind: ArtifactKind) -> PathBuf {
        self.output_dir.join(snapshot_file_name(mode_key, kind))
    }

    /// Creates the output directory and removes staging files left behind by
    /// an interrupted run. Published snapshots are left untouched.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| HarvestError::io(&self.output_dir, e))?;

        let mut entries = tokio::fs::read_dir(&self.output_dir)
            .await
            .map_err(|e| HarvestError::io(&self.output_dir, e))?;
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HarvestError::io(&self.output_dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(file = %name, error = %e, "Failed to remove stale staging file"),
                }
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale staging files");
        }
        Ok(())
    }

    /// Atomically replaces the snapshot for `result`'s mode and kind.
    ///
    /// Consumes the staged file: on failure it is deleted so the next cycle
    /// starts clean.
    pub async fn publish(&self, result: FetchResult) -> Result<PathBuf> {
        let target = self.target_path(&result.mode_key, result.kind);

        match tokio::fs::rename(&result.path, &target).await {
            Ok(()) => {
                debug!(
                    mode = %result.mode_key,
                    kind = %result.kind,
                    path = %target.display(),
                    bytes = result.bytes,
                    "Snapshot published"
                );
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&result.path).await {
                    debug!(path = %result.path.display(), error = %cleanup, "Staged file not removed");
                }
                Err(HarvestError::io(target, e))
            }
        }
    }
}
