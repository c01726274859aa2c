use anyhow::Context as _;
use kuchiki::traits::TendrilSink as _;
use kuchiki::{ElementData, NodeDataRef, NodeRef};
use url::Url;

use crate::assets::AssetFetcher;
use crate::formats::Article;

/// Attributes that would make a reader load something other than the rewritten `src`.
const STRIPPED_IMG_ATTRS: &[&str] = &["loading", "srcset", "sizes"];

/// Downloads every image referenced by `article` and points its `<img>` tags at the embedded
/// copies.
///
/// All downloads finish before any reference is rewritten, so an image that appears several
/// times in the article is fetched once and every occurrence sees the same reference. Images
/// that could not be fetched keep their original remote `src`.
pub async fn embed_images(article: &mut Article, fetcher: &AssetFetcher) {
    let base = Url::parse(&article.url).ok();

    let sources = match collect_image_sources(&article.content, base.as_ref()) {
        Ok(sources) => sources,
        Err(err) => {
            tracing::warn!(title = %article.title, ?err, "scan images failed; leaving content as is");
            return;
        }
    };
    if sources.is_empty() {
        tracing::debug!(title = %article.title, "no images to embed");
        return;
    }
    tracing::info!(title = %article.title, images = sources.len(), "embedding images");

    futures::future::join_all(sources.iter().map(|src| fetcher.ensure_local(src))).await;

    match rewrite_image_refs(&article.content, base.as_ref(), |src| fetcher.lookup(src)) {
        Ok(content) => article.content = content,
        Err(err) => tracing::warn!(
            title = %article.title,
            err = %format!("{err:#}"),
            "rewrite image references failed; article keeps remote images"
        ),
    }
}

/// Distinct, fetchable image locators in document order.
pub fn collect_image_sources(html: &str, base: Option<&Url>) -> anyhow::Result<Vec<String>> {
    let document = parse_fragment(html);
    let mut sources = Vec::new();
    for img in select_all(&document, "img")? {
        let attrs = img.attributes.borrow();
        let Some(src) = attrs.get("src") else {
            continue;
        };
        let Some(resolved) = resolve_image_url(src, base) else {
            continue;
        };
        if !sources.contains(&resolved) {
            sources.push(resolved);
        }
    }
    Ok(sources)
}

/// Rewrites every `<img src>` that `resolve` maps to a local reference and returns the
/// re-serialized fragment.
pub fn rewrite_image_refs<F>(html: &str, base: Option<&Url>, resolve: F) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let document = parse_fragment(html);

    for img in select_all(&document, "img")? {
        let mut attrs = img.attributes.borrow_mut();
        for name in STRIPPED_IMG_ATTRS {
            attrs.remove(*name);
        }

        let local = attrs
            .get("src")
            .and_then(|src| resolve_image_url(src, base))
            .and_then(|url| resolve(&url));
        if let Some(local) = local {
            tracing::debug!(src = ?attrs.get("src"), local = %local, "pointing image at embedded copy");
            attrs.insert("src", local);
        }
    }

    // `<picture>` sources would win over the rewritten `<img>`.
    for source in select_all(&document, "picture source")? {
        let mut attrs = source.attributes.borrow_mut();
        attrs.remove("srcset");
        attrs.remove("sizes");
    }

    serialize_fragment(&document)
}

fn resolve_image_url(src: &str, base: Option<&Url>) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    let url = match base {
        Some(base) => base.join(src).ok()?,
        None => Url::parse(src).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn parse_fragment(html: &str) -> NodeRef {
    kuchiki::parse_html().one(html)
}

fn select_all(document: &NodeRef, selector: &str) -> anyhow::Result<Vec<NodeDataRef<ElementData>>> {
    let matches = document
        .select(selector)
        .map_err(|()| anyhow::anyhow!("invalid css selector: {selector}"))?;
    Ok(matches.collect())
}

/// Writes the fragment back out. Leading `<style>`, `<meta>` and `<link>` nodes are hoisted into
/// `<head>` by the parser, so head children are emitted first, followed by the body's children.
fn serialize_fragment(document: &NodeRef) -> anyhow::Result<String> {
    let head = document
        .select_first("head")
        .map_err(|()| anyhow::anyhow!("parsed content has no head"))?;
    let body = document
        .select_first("body")
        .map_err(|()| anyhow::anyhow!("parsed content has no body"))?;

    let mut out = Vec::new();
    for child in head.as_node().children().chain(body.as_node().children()) {
        child
            .serialize(&mut out)
            .context("serialize content node")?;
    }
    String::from_utf8(out).context("serialized content is not utf-8")
}
