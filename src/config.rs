use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "PAGEBINDER_CONFIG";

/// Settings for one process invocation. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the generated EPUBs are written to. Empty means the current directory.
    #[serde(rename = "storepath")]
    pub store_path: String,

    /// Parent directory for per-run staging directories.
    #[serde(skip)]
    pub staging_root: PathBuf,

    #[serde(skip)]
    pub extract_timeout: Duration,
    #[serde(skip)]
    pub extract_retry: RetryPolicy,
    #[serde(skip)]
    pub image_retry: RetryPolicy,

    #[serde(skip)]
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: String::new(),
            staging_root: std::env::temp_dir(),
            extract_timeout: Duration::from_secs(30),
            extract_retry: RetryPolicy::new(3, Duration::from_secs(3)),
            image_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            user_agent: format!("pagebinder/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Reads the JSON config at `path`, or `$PAGEBINDER_CONFIG` when no path is given.
    /// Without either, the defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from),
        };
        let Some(path) = path else {
            tracing::debug!("no config file given; using defaults");
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("decode config json")?;
        Ok(config)
    }

    /// Resolves the output directory for generated files.
    pub fn store_dir(&self) -> PathBuf {
        let store_path = self.store_path.trim();
        if !store_path.is_empty() {
            return PathBuf::from(store_path);
        }
        match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(?err, "read current directory failed; falling back to ./");
                PathBuf::from("./")
            }
        }
    }
}
