use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A single web page.
    Url,
    /// A text file listing one web page per line.
    UrlFile,
    /// A document that is already on disk.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub locator: String,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(locator: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            locator: locator.into(),
            kind,
        }
    }
}

/// Readable content extracted from one input page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    /// HTML fragment; image references are rewritten in place once images are embedded.
    pub content: String,
    pub url: String,
    /// Position of the page in the run's input list.
    pub source_index: usize,
}
