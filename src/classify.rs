use std::path::Path;

use anyhow::Context as _;
use url::Url;

use crate::formats::{Request, RequestKind};

/// Sorts command-line inputs into page urls, url list files and ready documents.
///
/// Inputs that are neither an http(s) url nor an existing file are logged and dropped.
pub fn classify(inputs: &[String]) -> Vec<Request> {
    let mut requests = Vec::with_capacity(inputs.len());
    for input in inputs {
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if is_web_url(input) {
            requests.push(Request::new(input, RequestKind::Url));
            continue;
        }

        let path = Path::new(input);
        if !path.is_file() {
            tracing::warn!(input, "not a url or an existing file; ignoring");
            continue;
        }
        let is_url_list = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
        let kind = if is_url_list {
            RequestKind::UrlFile
        } else {
            RequestKind::File
        };
        requests.push(Request::new(input, kind));
    }
    tracing::debug!(?requests, "classified inputs");
    requests
}

fn is_web_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// Reads one locator per line, skipping blank lines and `#` comments.
pub fn extract_links_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read url list: {}", path.display()))?;
    let links = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_sorts_inputs_by_kind() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let links = temp.path().join("links.txt");
        let book = temp.path().join("book.epub");
        std::fs::write(&links, "https://example.com/a\n")?;
        std::fs::write(&book, b"PK")?;
        let missing = temp.path().join("missing.txt");

        let inputs = vec![
            "http://paulgraham.com/alien.html".to_owned(),
            links.display().to_string(),
            missing.display().to_string(),
            book.display().to_string(),
            "ftp://example.com/file".to_owned(),
        ];
        let requests = classify(&inputs);

        assert_eq!(
            requests,
            vec![
                Request::new("http://paulgraham.com/alien.html", RequestKind::Url),
                Request::new(links.display().to_string(), RequestKind::UrlFile),
                Request::new(book.display().to_string(), RequestKind::File),
            ]
        );
        Ok(())
    }

    #[test]
    fn url_list_skips_blanks_and_comments() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let links = temp.path().join("links.txt");
        std::fs::write(
            &links,
            "# essays\nhttp://paulgraham.com/alien.html\n\n   http://paulgraham.com/hwh.html  \r\n",
        )?;

        assert_eq!(
            extract_links_from_file(&links)?,
            vec![
                "http://paulgraham.com/alien.html".to_owned(),
                "http://paulgraham.com/hwh.html".to_owned(),
            ]
        );
        Ok(())
    }

    #[test]
    fn url_list_missing_file_is_an_error() {
        let err = extract_links_from_file(Path::new("/nonexistent/links.txt")).unwrap_err();
        assert!(format!("{err:#}").contains("read url list"));
    }
}
