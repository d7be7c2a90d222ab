//! Policy archive extraction
//!
//! Unpacks `.tgz` policy bundles into their extraction folder.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extract a gzip-compressed tarball into `dest`, replacing any previous contents.
pub async fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    let tarball: PathBuf = tarball.to_path_buf();
    let dest: PathBuf = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(&tarball, &dest))
        .await
        .context("Extraction task failed")?
}

fn extract_blocking(tarball: &Path, dest: &Path) -> Result<()> {
    let file = File::open(tarball)
        .with_context(|| format!("Failed to open {}", tarball.display()))?;

    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("Failed to clear {}", dest.display()))?;
    }
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    if let Err(e) = archive.unpack(dest) {
        let _ = std::fs::remove_dir_all(dest);
        return Err(e).with_context(|| {
            format!("Failed to extract {} into {}", tarball.display(), dest.display())
        });
    }

    debug!(tarball = %tarball.display(), dest = %dest.display(), "Archive extracted");
    Ok(())
}
