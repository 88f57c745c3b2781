use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersions {
    pub pdftoppm: Option<String>,
    pub tesseract: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractPaths {
    pub cache_root: String,
    pub manifest_dir: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractCounts {
    pub documents_requested: usize,
    pub documents_processed: usize,
    pub documents_ok: usize,
    pub documents_failed: usize,
    pub records_total: usize,
    pub reports_in_db: i64,
    pub test_records_in_db: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub source_path: String,
    pub doc_id: Option<String>,
    pub report_id: Option<i64>,
    pub ok: bool,
    pub extraction_path: Option<String>,
    pub layout_variant: Option<String>,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub transcriber: String,
    pub extractor: String,
    pub tool_versions: ToolVersions,
    pub paths: ExtractPaths,
    pub counts: ExtractCounts,
    pub documents: Vec<DocumentOutcome>,
    pub warnings: Vec<String>,
}
