use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tokio::task::JoinSet;

use crate::assets::{AssetFetcher, AssetSource, HttpAssetSource, download_to_staging, lock_book};
use crate::config::Config;
use crate::epub::{EpubBook, xml_escape};
use crate::extract::{ReadabilityExtractor, ReadableSource, extract_all};
use crate::formats::Article;
use crate::staging::{StagingArea, staged_file_name};

/// Conditions that abort a whole generation run.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("no readable url given, exiting without creating epub")]
    NoReadableContent,
    #[error("no article was added, epub creation failed")]
    NoArticleAdded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Turns lists of page urls into EPUB files.
pub struct Generator {
    config: Config,
    readable: Arc<dyn ReadableSource>,
    assets: Arc<dyn AssetSource>,
}

impl Generator {
    pub fn new(
        config: Config,
        readable: Arc<dyn ReadableSource>,
        assets: Arc<dyn AssetSource>,
    ) -> Self {
        Self {
            config,
            readable,
            assets,
        }
    }

    /// Generator backed by HTTP fetching and readability-js extraction.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let readable = ReadabilityExtractor::new(&config.user_agent)?;
        let assets = HttpAssetSource::new(&config.user_agent)?;
        Ok(Self::new(config, Arc::new(readable), Arc::new(assets)))
    }

    /// Builds one EPUB from `urls` and returns its path.
    ///
    /// An empty `title` inherits the title of the first extracted article. Pages, images and
    /// the cover fail independently; only a run that ends up with no article at all is an
    /// error. The staging directory is removed before this returns, whatever the outcome.
    pub async fn generate(
        &self,
        urls: &[String],
        title: &str,
        cover: Option<&str>,
    ) -> Result<PathBuf, GenerateError> {
        let staging = StagingArea::create(&self.config.staging_root, urls)
            .context("prepare staging area")?;
        let result = self.run(&staging, urls, title, cover).await;
        drop(staging);
        result
    }

    async fn run(
        &self,
        staging: &StagingArea,
        urls: &[String],
        title: &str,
        cover: Option<&str>,
    ) -> Result<PathBuf, GenerateError> {
        tracing::info!(urls = urls.len(), "generate: extract");
        let articles: Vec<Article> = extract_all(
            Arc::clone(&self.readable),
            urls,
            self.config.extract_timeout,
            self.config.extract_retry,
        )
        .await
        .into_iter()
        .flatten()
        .collect();
        let Some(first) = articles.first() else {
            return Err(GenerateError::NoReadableContent);
        };

        let title = if title.is_empty() {
            tracing::info!(title = %first.title, "no title supplied; using first article title");
            first.title.clone()
        } else {
            title.to_owned()
        };

        let book = Arc::new(Mutex::new(EpubBook::new(title.clone())));
        let fetcher = Arc::new(AssetFetcher::new(
            Arc::clone(&self.assets),
            staging.path(),
            Arc::clone(&book),
            self.config.image_retry,
        ));

        tracing::info!(articles = articles.len(), "generate: images");
        let articles = embed_all(Arc::clone(&fetcher), articles).await;
        tracing::info!(
            embedded = fetcher.registry().embedded_count(),
            "generate: images done"
        );
        drop(fetcher);

        tracing::info!("generate: assemble");
        let added = add_content(&mut *lock_book(&book)?, &articles);
        if added == 0 {
            return Err(GenerateError::NoArticleAdded);
        }

        if let Some(cover) = cover.map(str::trim).filter(|c| !c.is_empty()) {
            if let Err(err) = self.attach_cover(staging, &book, cover).await {
                tracing::warn!(cover, err = %format!("{err:#}"), "cover image skipped");
            }
        }

        let out_path = self
            .config
            .store_dir()
            .join(output_file_name(&title, staging.name()));
        tracing::info!(out = %out_path.display(), "generate: write");
        let book = Arc::try_unwrap(book)
            .map_err(|_| anyhow::anyhow!("epub book is still shared after assembly"))?
            .into_inner()
            .map_err(|_| anyhow::anyhow!("epub book lock poisoned"))?;
        let target = out_path.clone();
        tokio::task::spawn_blocking(move || book.write(&target))
            .await
            .context("join epub writer")?
            .with_context(|| format!("write epub: {}", out_path.display()))?;

        Ok(out_path)
    }

    async fn attach_cover(
        &self,
        staging: &StagingArea,
        book: &Mutex<EpubBook>,
        cover: &str,
    ) -> anyhow::Result<()> {
        let local = Path::new(cover);
        let path = if local.is_file() {
            local.to_path_buf()
        } else {
            let target = staging
                .path()
                .join(format!("cover-{}", staged_file_name(cover)));
            download_to_staging(self.assets.as_ref(), cover, &target, self.config.image_retry)
                .await
                .context("download cover image")?
        };

        let mut book = lock_book(book)?;
        let href = book.add_image(&path, "cover")?;
        book.set_cover(&href)
    }
}

/// Runs the image pass for every article concurrently and returns them in their original order.
async fn embed_all(fetcher: Arc<AssetFetcher>, articles: Vec<Article>) -> Vec<Article> {
    let mut tasks = JoinSet::new();
    let mut slots = Vec::with_capacity(articles.len());

    for (position, article) in articles.into_iter().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        let mut working = article.clone();
        slots.push(article);
        tasks.spawn(async move {
            crate::images::embed_images(&mut working, &fetcher).await;
            (position, working)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, article)) => slots[position] = article,
            Err(err) => tracing::warn!(?err, "image task failed; article keeps remote images"),
        }
    }
    slots
}

fn add_content(book: &mut EpubBook, articles: &[Article]) -> usize {
    let mut added = 0;
    for article in articles {
        match book.add_section(&section_html(article), &article.title) {
            Ok(_) => added += 1,
            Err(err) => tracing::warn!(
                title = %article.title,
                url = %article.url,
                err = %format!("{err:#}"),
                "could not add article to epub"
            ),
        }
    }
    tracing::info!(added, "added articles");
    added
}

fn section_html(article: &Article) -> String {
    format!("<h1>{}</h1>{}", xml_escape(&article.title), article.content)
}

/// `<slug>.epub`, or a name derived from the staging directory when the title has no
/// sluggable characters.
pub fn output_file_name(title: &str, staging_name: &str) -> String {
    let title_slug = slug::slugify(title);
    if title_slug.is_empty() {
        format!("pagebinder-doc-{staging_name}.epub")
    } else {
        format!("{title_slug}.epub")
    }
}
