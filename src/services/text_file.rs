use std::fs;
use std::path::PathBuf;

use super::{RegionHint, ServiceError, Transcriber};

/// Serves a transcript produced elsewhere. The document bytes are ignored.
pub struct TextFileTranscriber {
    path: PathBuf,
}

impl TextFileTranscriber {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Transcriber for TextFileTranscriber {
    fn name(&self) -> &'static str {
        "text-file"
    }

    fn transcribe(
        &self,
        _document: &[u8],
        _region: Option<&RegionHint>,
    ) -> Result<String, ServiceError> {
        Ok(fs::read_to_string(&self.path)?)
    }
}
