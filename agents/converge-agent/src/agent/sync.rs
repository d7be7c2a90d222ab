//! Filesystem Synchronizer
//!
//! Downloads and extracts policy bundles into the working directory and
//! removes entries no longer referenced by the current cycle.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::agent::model::PolicyState;
use crate::connection::client::ControlPlane;
use crate::runtime::archive::extract_tarball;

/// Synchronizer for policy bundles
pub struct Synchronizer<C: ControlPlane> {
    control_plane: Arc<C>,
}

impl<C: ControlPlane> Synchronizer<C> {
    pub fn new(control_plane: Arc<C>) -> Self {
        Self { control_plane }
    }

    /// Download and extract one policy.
    ///
    /// A non-200 response leaves the policy un-downloaded; an extraction
    /// failure leaves it downloaded but not extracted. Only transport
    /// failures are returned as errors.
    pub async fn download(&self, policy: &PolicyState) -> Result<PolicyState> {
        let status = self
            .control_plane
            .download_artifact(policy.relative_query_path(), policy.tarball_local_path())
            .await
            .with_context(|| format!("Failed to download policy {}", policy.name()))?;

        if status != 200 {
            warn!(
                policy = %policy.name(),
                status = status,
                "Policy download rejected by control plane"
            );
            return Ok(policy.clone());
        }

        let downloaded = policy.clone().with_downloaded();
        debug!(policy = %policy.name(), "Policy tarball downloaded");

        match extract_tarball(downloaded.tarball_local_path(), downloaded.extracted_folder_path())
            .await
        {
            Ok(()) => {
                info!(policy = %policy.name(), "Policy synchronized");
                Ok(downloaded.with_extracted())
            }
            Err(e) => {
                error!(policy = %policy.name(), error = %format!("{:#}", e), "Failed to extract policy");
                Ok(downloaded)
            }
        }
    }

    /// Synchronize every policy in order; one policy's failure does not
    /// affect the others.
    pub async fn sync_all(&self, policies: Vec<PolicyState>) -> Vec<PolicyState> {
        let mut synced = Vec::with_capacity(policies.len());
        for policy in policies {
            match self.download(&policy).await {
                Ok(next) => synced.push(next),
                Err(e) => {
                    error!(policy = %policy.name(), error = %format!("{:#}", e), "Policy download failed");
                    synced.push(policy);
                }
            }
        }
        synced
    }
}

/// Outcome of a cleanup pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Remove every direct child of `workdir` whose name is not in `retained`.
///
/// Failing to list the directory is an error; failing to remove a single
/// entry is logged and recorded in the report.
pub async fn cleanup(workdir: &Path, retained: &HashSet<String>) -> Result<CleanupReport> {
    let mut entries = tokio::fs::read_dir(workdir)
        .await
        .with_context(|| format!("Failed to list {}", workdir.display()))?;

    let mut report = CleanupReport::default();

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", workdir.display()))?
    {
        let keep = entry
            .file_name()
            .to_str()
            .map(|name| retained.contains(name))
            .unwrap_or(false);
        if keep {
            continue;
        }

        let path = entry.path();
        match remove_entry(&entry).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale entry");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove stale entry");
                report.failed.push(path);
            }
        }
    }

    report.removed.sort();
    report.failed.sort();
    Ok(report)
}

async fn remove_entry(entry: &tokio::fs::DirEntry) -> std::io::Result<()> {
    // file_type does not follow symlinks, so a link to a directory is unlinked
    if entry.file_type().await?.is_dir() {
        tokio::fs::remove_dir_all(entry.path()).await
    } else {
        tokio::fs::remove_file(entry.path()).await
    }
}
