use std::fs;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::render::{DEFAULT_RENDER_DPI, render_pages};
use super::{RegionHint, SchemaExtractor, ServiceError, Transcriber};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

const TRANSCRIBE_PROMPT: &str = "Transcribe every table in these grade report pages as plain \
text, one table row per line, keeping column order. Write a dash for empty cells. Output \
only the transcription.";

const EXTRACT_PROMPT: &str = "Read the grade report pages and return every test \
administration as JSON matching the provided schema. Use test_type 育成テスト for periodic \
growth tests and 公開模試 for open mock exams. Use null for anything not printed.";

/// Vision model behind a local Ollama instance. Serves as both the transcriber and the
/// schema-constrained extractor.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| ServiceError::Http(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    fn page_images(
        &self,
        document: &[u8],
        pages: Option<(u32, u32)>,
    ) -> Result<Vec<String>, ServiceError> {
        let rendered = render_pages(document, pages, DEFAULT_RENDER_DPI)?;
        rendered
            .images
            .iter()
            .map(|path| Ok(BASE64.encode(fs::read(path)?)))
            .collect()
    }

    fn generate(
        &self,
        prompt: &str,
        images: Vec<String>,
        format: Option<&Value>,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            images,
            stream: false,
            format,
        };

        let response = self.client.post(&url).json(&body).send().map_err(|err| {
            if err.is_connect() {
                ServiceError::Unavailable(format!("cannot reach Ollama at {}", self.base_url))
            } else if err.is_timeout() {
                ServiceError::Http(format!("request timed out after {}s", self.timeout_secs))
            } else {
                ServiceError::Http(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Response(format!(
                "Ollama returned {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|err| ServiceError::Response(err.to_string()))?;
        debug!(model = %self.model, chars = parsed.response.len(), "ollama generation finished");
        Ok(parsed.response)
    }
}

impl Transcriber for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn transcribe(
        &self,
        document: &[u8],
        region: Option<&RegionHint>,
    ) -> Result<String, ServiceError> {
        let images = self.page_images(document, region.and_then(RegionHint::page_range))?;
        let prompt = match region {
            Some(region) => format!("{TRANSCRIBE_PROMPT}\nFocus on: {}", region.as_str()),
            None => TRANSCRIBE_PROMPT.to_string(),
        };
        self.generate(&prompt, images, None)
    }
}

impl SchemaExtractor for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn extract(&self, document: &[u8], schema: &Value) -> Result<String, ServiceError> {
        let images = self.page_images(document, None)?;
        self.generate(EXTRACT_PROMPT, images, Some(schema))
    }
}
