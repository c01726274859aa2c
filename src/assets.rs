use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::epub::EpubBook;
use crate::retry::{RetryPolicy, with_retry};
use crate::staging::staged_file_name;

/// Source of raw asset bytes.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Fetches `url`; a non-success status is an error.
    async fn fetch_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpAssetSource {
    client: reqwest::Client,
}

impl HttpAssetSource {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(user_agent)
            .build()
            .context("build asset http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn fetch_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: unexpected status {status}");
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("read body: {url}"))?;
        Ok(bytes.to_vec())
    }
}

/// Downloads `url` into `target` unless a staged copy is already there.
///
/// Bytes land in a sibling `.part` file first, so an existing `target` is always complete.
pub async fn download_to_staging(
    source: &dyn AssetSource,
    url: &str,
    target: &Path,
    policy: RetryPolicy,
) -> anyhow::Result<PathBuf> {
    if tokio::fs::try_exists(target).await.unwrap_or(false) {
        tracing::debug!(url, path = %target.display(), "already staged; skipping download");
        return Ok(target.to_path_buf());
    }

    let bytes = with_retry(policy, "download asset", |_| source.fetch_bytes(url)).await?;

    let partial = target.with_extension("part");
    if let Err(err) = tokio::fs::write(&partial, &bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("write staged asset: {}", partial.display()));
    }
    tokio::fs::rename(&partial, target)
        .await
        .with_context(|| format!("move staged asset into place: {}", target.display()))?;

    tracing::debug!(url, bytes = bytes.len(), path = %target.display(), "staged asset");
    Ok(target.to_path_buf())
}

/// Run-scoped map from image locator to the in-book reference of its embedded copy.
///
/// Each key owns a once-cell: the first caller performs the download and every concurrent or
/// later caller for the same locator waits on that result instead of downloading again.
/// A failed image is recorded as `None` and is not retried within the run.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    entries: DashMap<String, Arc<OnceCell<Option<String>>>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reference recorded for `locator`, without any I/O.
    pub fn lookup(&self, locator: &str) -> Option<String> {
        self.entries
            .get(locator)
            .and_then(|cell| cell.value().get().cloned().flatten())
    }

    pub async fn get_or_fetch<F, Fut>(&self, locator: &str, fetch: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        // The map guard must be released before awaiting.
        let cell = Arc::clone(&self.entries.entry(locator.to_owned()).or_default());
        cell.get_or_init(fetch).await.clone()
    }

    /// Number of locators that resolved to an embedded image.
    pub fn embedded_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value().get(), Some(Some(_))))
            .count()
    }
}

/// Materializes remote images into the staging area and the book, once per locator.
pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
    registry: ImageRegistry,
    staging_dir: PathBuf,
    book: Arc<Mutex<EpubBook>>,
    policy: RetryPolicy,
}

impl AssetFetcher {
    pub fn new(
        source: Arc<dyn AssetSource>,
        staging_dir: &Path,
        book: Arc<Mutex<EpubBook>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            registry: ImageRegistry::new(),
            staging_dir: staging_dir.to_path_buf(),
            book,
            policy,
        }
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    /// Resolves `url` to an in-book image reference, downloading and embedding it on first use.
    /// Returns `None` when the image could not be retrieved.
    pub async fn ensure_local(&self, url: &str) -> Option<String> {
        self.registry
            .get_or_fetch(url, || async {
                match self.materialize(url).await {
                    Ok(href) => {
                        tracing::debug!(url, href = %href, "embedded image");
                        Some(href)
                    }
                    Err(err) => {
                        tracing::warn!(url, err = %format!("{err:#}"), "skipping image");
                        None
                    }
                }
            })
            .await
    }

    pub fn lookup(&self, url: &str) -> Option<String> {
        self.registry.lookup(url)
    }

    async fn materialize(&self, url: &str) -> anyhow::Result<String> {
        let name = staged_file_name(url);
        let target = self.staging_dir.join(&name);
        let path = download_to_staging(self.source.as_ref(), url, &target, self.policy).await?;

        let mut book = lock_book(&self.book)?;
        book.add_image(&path, &name)
            .with_context(|| format!("add image to book: {url}"))
    }
}

pub(crate) fn lock_book(book: &Mutex<EpubBook>) -> anyhow::Result<MutexGuard<'_, EpubBook>> {
    book.lock()
        .map_err(|_| anyhow::anyhow!("epub book lock poisoned"))
}
