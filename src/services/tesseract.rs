use std::process::Command;

use tracing::debug;

use super::render::{DEFAULT_RENDER_DPI, render_pages};
use super::{RegionHint, ServiceError, Transcriber};

/// Local OCR: pdftoppm page images fed to tesseract one page at a time.
pub struct TesseractTranscriber {
    lang: String,
    dpi: u32,
}

impl TesseractTranscriber {
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            dpi: DEFAULT_RENDER_DPI,
        }
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }
}

impl Transcriber for TesseractTranscriber {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn transcribe(
        &self,
        document: &[u8],
        region: Option<&RegionHint>,
    ) -> Result<String, ServiceError> {
        let pages = region.and_then(RegionHint::page_range);
        let rendered = render_pages(document, pages, self.dpi)?;

        let mut text = String::new();
        for image in &rendered.images {
            let output = Command::new("tesseract")
                .arg(image)
                .arg("stdout")
                .arg("-l")
                .arg(&self.lang)
                .arg("--psm")
                .arg("6")
                .output()
                .map_err(|err| ServiceError::Command {
                    program: "tesseract".to_string(),
                    detail: err.to_string(),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ServiceError::Command {
                    program: "tesseract".to_string(),
                    detail: format!("{}: {}", image.display(), stderr.trim()),
                });
            }

            let page_text = String::from_utf8_lossy(&output.stdout).replace('\u{0000}', "");
            debug!(image = %image.display(), chars = page_text.len(), "transcribed page");
            text.push_str(page_text.trim());
            text.push('\n');
        }

        Ok(text.trim_end().to_string())
    }
}
