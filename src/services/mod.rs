//! Collaborators the report pipeline talks to. Each one is a trait so commands can
//! inject the local implementations and tests can inject fakes.

pub mod local_store;
pub mod ollama;
pub mod render;
pub mod tesseract;
pub mod text_file;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use local_store::LocalDocumentStore;
pub use ollama::OllamaClient;
pub use tesseract::TesseractTranscriber;
pub use text_file::TextFileTranscriber;

static PAGE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:pages?|p\.?|ページ)\s*(?P<first>\d{1,3})(?:\s*[-~〜]\s*(?P<last>\d{1,3}))?")
        .expect("valid page range regex")
});

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("document store failure: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected service response: {0}")]
    Response(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed reference to a stored source document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentHandle(String);

impl DocumentHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Free-form region-of-interest hint passed through to a transcriber, e.g. "page 2" or
/// "成績推移 table".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHint(String);

impl RegionHint {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Inclusive 1-based page range named by the hint, if any.
    pub fn page_range(&self) -> Option<(u32, u32)> {
        let captures = PAGE_RANGE.captures(&self.0)?;
        let first = captures.name("first")?.as_str().parse::<u32>().ok()?;
        let last = captures
            .name("last")
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(first);
        if first == 0 || last < first {
            return None;
        }
        Some((first, last))
    }
}

pub trait DocumentStore: Send + Sync {
    fn put(&self, bytes: &[u8], name: &str) -> Result<DocumentHandle, ServiceError>;
    fn get(&self, handle: &DocumentHandle) -> Result<Vec<u8>, ServiceError>;
}

pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Best-effort plain text for the document, or for one region of it. Empty text is a
    /// valid answer.
    fn transcribe(&self, document: &[u8], region: Option<&RegionHint>)
    -> Result<String, ServiceError>;
}

pub trait SchemaExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw model output constrained by `schema`; validation happens in the caller.
    fn extract(&self, document: &[u8], schema: &Value) -> Result<String, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_hint_reads_single_pages_and_ranges() {
        assert_eq!(RegionHint::new("page 2").page_range(), Some((2, 2)));
        assert_eq!(RegionHint::new("pages 1-3").page_range(), Some((1, 3)));
        assert_eq!(RegionHint::new("p.4").page_range(), Some((4, 4)));
        assert_eq!(RegionHint::new("成績推移 table").page_range(), None);
        assert_eq!(RegionHint::new("pages 3-1").page_range(), None);
    }

    #[test]
    fn document_handle_displays_its_id() {
        let handle = DocumentHandle::new("abc123");
        assert_eq!(handle.to_string(), "abc123");
        assert_eq!(handle.as_str(), "abc123");
    }
}
