use std::path::Path;

use crate::classify::extract_links_from_file;
use crate::formats::{Request, RequestKind};
use crate::generate::Generator;

/// Turns classified requests into documents on disk, one generation run per request.
///
/// Ready documents pass through untouched. A request whose run fails is logged and left out;
/// it never stops the remaining requests.
pub async fn process(
    generator: &Generator,
    requests: Vec<Request>,
    title: &str,
    cover: Option<&str>,
) -> Vec<Request> {
    let mut processed = Vec::with_capacity(requests.len());
    for request in requests {
        let urls = match request.kind {
            RequestKind::File => {
                processed.push(request);
                continue;
            }
            RequestKind::Url => vec![request.locator.clone()],
            RequestKind::UrlFile => match extract_links_from_file(Path::new(&request.locator)) {
                Ok(links) => links,
                Err(err) => {
                    tracing::warn!(
                        locator = %request.locator,
                        err = %format!("{err:#}"),
                        "skipping"
                    );
                    continue;
                }
            },
        };

        tracing::info!(locator = %request.locator, urls = urls.len(), "processing request");
        match generator.generate(&urls, title, cover).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "generated epub");
                processed.push(Request::new(path.display().to_string(), RequestKind::File));
            }
            Err(err) => tracing::warn!(
                locator = %request.locator,
                err = %format!("{err:#}"),
                "skipping"
            ),
        }
    }
    processed
}
