use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

/// Per-run scratch directory for downloaded assets.
///
/// The directory name is derived from the run's input locators, and every staged file is named
/// after its locator, so a rerun over the same inputs finds earlier downloads in place. The
/// directory is removed when the value is dropped, on success and failure alike.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    name: String,
}

impl StagingArea {
    pub fn create(root: &Path, locators: &[String]) -> anyhow::Result<Self> {
        let name = staging_dir_name(locators);
        let dir = root.join(&name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create staging dir: {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "created staging dir");
        Ok(Self { dir, name })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deterministic location of the staged copy of `locator`.
    pub fn file_path(&self, locator: &str) -> PathBuf {
        self.dir.join(staged_file_name(locator))
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(dir = %self.dir.display(), "removed staging dir"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), ?err, "remove staging dir failed")
            }
        }
    }
}

pub fn staging_dir_name(locators: &[String]) -> String {
    format!("tmp-{}", short_hash(&locators.join("-")))
}

pub fn staged_file_name(locator: &str) -> String {
    short_hash(locator)
}

fn short_hash(input: &str) -> String {
    let digest = sha2::Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}
