use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use url::Url;

use crate::formats::Article;
use crate::retry::{RetryPolicy, with_retry};

/// Upstream proxies sometimes answer with a "502 Bad Gateway" page that readability happily
/// extracts; a title carrying this marker is treated as a failed attempt.
pub const TRANSIENT_TITLE_MARKER: &str = "502";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readable {
    pub title: String,
    pub content: String,
}

/// Turns a page locator into its readable title and HTML content.
#[async_trait]
pub trait ReadableSource: Send + Sync {
    async fn extract_readable(&self, url: &str, timeout: Duration) -> anyhow::Result<Readable>;
}

/// Fetches pages over HTTP and runs them through readability-js.
#[derive(Debug, Clone)]
pub struct ReadabilityExtractor {
    client: reqwest::Client,
}

impl ReadabilityExtractor {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(user_agent)
            .build()
            .context("build page http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReadableSource for ReadabilityExtractor {
    async fn extract_readable(&self, url: &str, timeout: Duration) -> anyhow::Result<Readable> {
        let parsed = Url::parse(url).with_context(|| format!("parse url: {url}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("url must be http/https: {url}");
        }

        let response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: unexpected status {status}");
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))?;

        tokio::task::spawn_blocking(move || parse_readable(&html, &final_url))
            .await
            .context("join readability task")?
    }
}

fn parse_readable(html: &str, url: &str) -> anyhow::Result<Readable> {
    let readability = Readability::new().context("initialize readability-js")?;
    let article = match readability.parse_with_url(html, url) {
        Ok(article) => article,
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            tracing::debug!(url, "readability check failed; retrying with relaxed options");
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            readability
                .parse_with_options(html, Some(url), Some(options))
                .with_context(|| format!("extract readable content: {url}"))?
        }
        Err(err) => {
            return Err(err).with_context(|| format!("extract readable content: {url}"));
        }
    };

    let title = if article.title.trim().is_empty() {
        url.to_owned()
    } else {
        article.title.trim().to_owned()
    };
    Ok(Readable {
        title,
        content: article.content,
    })
}

/// Extracts one page, retrying on errors and on transient-failure titles.
pub async fn fetch_readable(
    source: &dyn ReadableSource,
    url: &str,
    timeout: Duration,
    policy: RetryPolicy,
) -> anyhow::Result<Readable> {
    with_retry(policy, "extract readable content", |_| async move {
        let readable = source.extract_readable(url, timeout).await?;
        if readable.title.contains(TRANSIENT_TITLE_MARKER) {
            anyhow::bail!("upstream served a transient failure page: {:?}", readable.title);
        }
        Ok::<_, anyhow::Error>(readable)
    })
    .await
    .with_context(|| format!("extract {url}"))
}

/// Extracts every url concurrently and returns one slot per input, in input order.
/// A slot is `None` when its page could not be extracted.
pub async fn extract_all(
    source: Arc<dyn ReadableSource>,
    urls: &[String],
    timeout: Duration,
    policy: RetryPolicy,
) -> Vec<Option<Article>> {
    let (tx, mut rx) = mpsc::channel::<(usize, Option<Article>)>(urls.len().max(1));

    for (index, url) in urls.iter().enumerate() {
        let tx = tx.clone();
        let source = Arc::clone(&source);
        let url = url.clone();
        tokio::spawn(async move {
            let article = match fetch_readable(source.as_ref(), &url, timeout, policy).await {
                Ok(readable) => {
                    tracing::info!(url = %url, title = %readable.title, "fetched readable content");
                    Some(Article {
                        title: readable.title,
                        content: readable.content,
                        url,
                        source_index: index,
                    })
                }
                Err(err) => {
                    tracing::warn!(url = %url, err = %format!("{err:#}"), "skipping url");
                    None
                }
            };
            let _ = tx.send((index, article)).await;
        });
    }
    drop(tx);

    let mut slots: Vec<Option<Article>> = (0..urls.len()).map(|_| None).collect();
    while let Some((index, article)) = rx.recv().await {
        if let Some(slot) = slots.get_mut(index) {
            *slot = article;
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    struct ScriptedSource {
        titles: Mutex<HashMap<String, Vec<&'static str>>>,
    }

    impl ScriptedSource {
        fn new(script: &[(&str, Vec<&'static str>)]) -> Self {
            let titles = script
                .iter()
                .map(|(url, titles)| (url.to_string(), titles.clone()))
                .collect();
            Self {
                titles: Mutex::new(titles),
            }
        }
    }

    #[async_trait]
    impl ReadableSource for ScriptedSource {
        async fn extract_readable(&self, url: &str, _timeout: Duration) -> anyhow::Result<Readable> {
            let next = {
                let mut titles = self.titles.lock().unwrap();
                let queue = titles.get_mut(url).filter(|q| !q.is_empty());
                queue.map(|q| q.remove(0))
            };
            match next {
                Some("ERR") | None => anyhow::bail!("GET {url}: connection refused"),
                Some(title) => Ok(Readable {
                    title: title.to_owned(),
                    content: format!("<p>{title}</p>"),
                }),
            }
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    #[tokio::test]
    async fn transient_title_is_retried() -> anyhow::Result<()> {
        let source = ScriptedSource::new(&[("https://a", vec!["502 Bad Gateway", "Alien"])]);
        let readable = fetch_readable(&source, "https://a", Duration::from_secs(1), fast()).await?;
        assert_eq!(readable.title, "Alien");
        Ok(())
    }

    #[tokio::test]
    async fn persistent_transient_title_fails() {
        let source = ScriptedSource::new(&[(
            "https://a",
            vec!["502 Bad Gateway", "502 Bad Gateway", "502 Bad Gateway", "Alien"],
        )]);
        let err = fetch_readable(&source, "https://a", Duration::from_secs(1), fast())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("transient failure page"));
    }

    #[tokio::test]
    async fn errors_are_retried_up_to_the_limit() -> anyhow::Result<()> {
        let source = ScriptedSource::new(&[("https://a", vec!["ERR", "ERR", "Third time"])]);
        let readable = fetch_readable(&source, "https://a", Duration::from_secs(1), fast()).await?;
        assert_eq!(readable.title, "Third time");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extract_all_keeps_input_slots() {
        let source: Arc<dyn ReadableSource> = Arc::new(ScriptedSource::new(&[
            ("https://a", vec!["A"]),
            ("https://b", vec!["ERR", "ERR", "ERR"]),
            ("https://c", vec!["C"]),
        ]));
        let urls = vec![
            "https://a".to_owned(),
            "https://b".to_owned(),
            "https://c".to_owned(),
        ];

        let slots = extract_all(source, &urls, Duration::from_secs(1), fast()).await;
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].as_ref().map(|a| a.title.as_str()), Some("A"));
        assert!(slots[1].is_none());
        let c = slots[2].as_ref().unwrap();
        assert_eq!(c.source_index, 2);
        assert_eq!(c.url, "https://c");
    }

    #[tokio::test]
    async fn extract_all_with_no_urls_is_empty() {
        let source: Arc<dyn ReadableSource> = Arc::new(ScriptedSource::new(&[]));
        let slots = extract_all(source, &[], Duration::from_secs(1), fast()).await;
        assert!(slots.is_empty());
    }
}
