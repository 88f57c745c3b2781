use std::thread;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::classify::LabelClassifier;
use super::disambiguate::{LayoutHint, LayoutSelection, parse_transcript};
use super::layout::LayoutCatalog;
use super::normalize::non_whitespace_char_count;
use super::reconcile::{ReconcileStats, reconcile};
use super::schema::{extraction_schema, records_from_payload};
use super::trend::{TrendSummary, summarize_trends};
use super::types::TestRecord;
use crate::services::{
    DocumentHandle, DocumentStore, RegionHint, SchemaExtractor, ServiceError, Transcriber,
};

/// Upper bound on region transcriptions running at once for one document.
pub const MAX_CONCURRENT_REGIONS: usize = 4;

pub const EMPTY_RESULT_REASON: &str =
    "no periodic-growth or open-mock records survived reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionPath {
    Transcription,
    SchemaFallback,
    None,
}

impl ExtractionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionPath::Transcription => "transcription",
            ExtractionPath::SchemaFallback => "schema-fallback",
            ExtractionPath::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub handle: DocumentHandle,
    pub layout: LayoutHint,
    pub region_hints: Vec<RegionHint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub layout: Option<LayoutSelection>,
    pub transcriber: Option<String>,
    pub extractor: Option<String>,
    pub transcription_chars: usize,
    pub regions_transcribed: usize,
    pub skipped_rows: usize,
    pub reconcile: ReconcileStats,
    pub raw_extraction_text: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: Option<DocumentHandle>,
    pub ok: bool,
    pub error: Option<String>,
    pub extraction_path: ExtractionPath,
    pub records: Vec<TestRecord>,
    pub trends: Vec<TrendSummary>,
    pub diagnostics: Diagnostics,
}

/// External collaborators for one run. Only the store is mandatory.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a dyn DocumentStore,
    pub transcriber: Option<&'a dyn Transcriber>,
    pub extractor: Option<&'a dyn SchemaExtractor>,
}

pub struct ReportPipeline {
    catalog: LayoutCatalog,
    classifier: LabelClassifier,
}

impl ReportPipeline {
    pub fn new() -> Result<Self> {
        Ok(Self {
            catalog: LayoutCatalog::new()?,
            classifier: LabelClassifier::new()?,
        })
    }

    /// Runs one stored document to a canonical report. Only a storage failure is an
    /// error; everything downstream degrades into `ok: false` with a reason.
    pub fn process(&self, services: Services<'_>, request: &DocumentRequest) -> Result<DocumentReport> {
        let document = services
            .store
            .get(&request.handle)
            .with_context(|| format!("failed to load document {}", request.handle))?;

        let mut diagnostics = Diagnostics::default();

        if let Some(transcriber) = services.transcriber {
            diagnostics.transcriber = Some(transcriber.name().to_string());
            let text = transcribe_document(
                transcriber,
                &document,
                &request.region_hints,
                &mut diagnostics,
            );

            if let Some(text) = text.filter(|text| non_whitespace_char_count(text) > 0) {
                diagnostics.transcription_chars = text.chars().count();
                let parsed = parse_transcript(&text, request.layout, &self.catalog, &self.classifier);
                diagnostics.layout = Some(parsed.selection);
                diagnostics.skipped_rows = parsed.parsed.skipped_rows;

                if !parsed.parsed.records.is_empty() {
                    return Ok(self.finish(
                        Some(request.handle.clone()),
                        ExtractionPath::Transcription,
                        parsed.parsed.records,
                        diagnostics,
                    ));
                }

                warn!(document = %request.handle, "transcription yielded no table rows; falling back");
                diagnostics
                    .warnings
                    .push("transcription yielded no table rows".to_string());
            } else {
                warn!(document = %request.handle, "no usable transcription; falling back");
                diagnostics
                    .warnings
                    .push("no usable transcription text".to_string());
            }
        }

        Ok(self.fallback(request, &document, services.extractor, diagnostics))
    }

    /// Runs a transcript through parsing, reconciliation and trends with no services.
    pub fn process_text(&self, text: &str, layout: LayoutHint) -> DocumentReport {
        let mut diagnostics = Diagnostics {
            transcription_chars: text.chars().count(),
            ..Diagnostics::default()
        };

        if non_whitespace_char_count(text) == 0 {
            return failed_report(None, ExtractionPath::None, "transcript is empty", diagnostics);
        }

        let parsed = parse_transcript(text, layout, &self.catalog, &self.classifier);
        diagnostics.layout = Some(parsed.selection);
        diagnostics.skipped_rows = parsed.parsed.skipped_rows;
        self.finish(None, ExtractionPath::Transcription, parsed.parsed.records, diagnostics)
    }

    fn fallback(
        &self,
        request: &DocumentRequest,
        document: &[u8],
        extractor: Option<&dyn SchemaExtractor>,
        mut diagnostics: Diagnostics,
    ) -> DocumentReport {
        let handle = Some(request.handle.clone());
        let Some(extractor) = extractor else {
            return failed_report(
                handle,
                ExtractionPath::None,
                "transcription unavailable and no schema extractor configured",
                diagnostics,
            );
        };
        diagnostics.extractor = Some(extractor.name().to_string());

        let raw = match extractor.extract(document, &extraction_schema()) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(document = %request.handle, error = %err, "schema extraction failed");
                return failed_report(
                    handle,
                    ExtractionPath::None,
                    &format!("transcription and schema extraction both failed: {err}"),
                    diagnostics,
                );
            }
        };

        match records_from_payload(&raw, &self.classifier) {
            Ok(coerced) => {
                if coerced.skipped_entries > 0 {
                    warn!(
                        document = %request.handle,
                        skipped = coerced.skipped_entries,
                        "schema extraction entries were not objects"
                    );
                    diagnostics.warnings.push(format!(
                        "skipped {} extraction entries that were not test objects",
                        coerced.skipped_entries
                    ));
                }
                info!(document = %request.handle, records = coerced.records.len(), "schema extraction parsed");
                self.finish(handle, ExtractionPath::SchemaFallback, coerced.records, diagnostics)
            }
            Err(violation) => {
                warn!(document = %request.handle, error = %violation, "schema extraction output rejected");
                diagnostics.raw_extraction_text = Some(raw);
                failed_report(
                    handle,
                    ExtractionPath::SchemaFallback,
                    &violation.to_string(),
                    diagnostics,
                )
            }
        }
    }

    fn finish(
        &self,
        document: Option<DocumentHandle>,
        path: ExtractionPath,
        provisional: Vec<TestRecord>,
        mut diagnostics: Diagnostics,
    ) -> DocumentReport {
        let reconciled = reconcile(provisional, &self.classifier);
        diagnostics.reconcile = reconciled.stats;
        let records = reconciled.records;
        let trends = summarize_trends(&records);

        info!(
            path = path.as_str(),
            records = records.len(),
            dropped_other = diagnostics.reconcile.dropped_other,
            duplicates = diagnostics.reconcile.duplicates_removed,
            "document reconciled"
        );

        let error = records.is_empty().then(|| EMPTY_RESULT_REASON.to_string());
        DocumentReport {
            document,
            ok: error.is_none(),
            error,
            extraction_path: path,
            records,
            trends,
            diagnostics,
        }
    }
}

fn failed_report(
    document: Option<DocumentHandle>,
    path: ExtractionPath,
    reason: &str,
    diagnostics: Diagnostics,
) -> DocumentReport {
    DocumentReport {
        document,
        ok: false,
        error: Some(reason.to_string()),
        extraction_path: path,
        records: Vec::new(),
        trends: Vec::new(),
        diagnostics,
    }
}

/// Whole-document transcription, or one call per region hint joined in hint order, at
/// most [`MAX_CONCURRENT_REGIONS`] in flight. `None` when every call failed.
fn transcribe_document(
    transcriber: &dyn Transcriber,
    document: &[u8],
    regions: &[RegionHint],
    diagnostics: &mut Diagnostics,
) -> Option<String> {
    if regions.is_empty() {
        return match transcriber.transcribe(document, None) {
            Ok(text) => {
                diagnostics.regions_transcribed = 1;
                Some(text)
            }
            Err(err) => {
                record_transcription_failure(transcriber, None, &err, diagnostics);
                None
            }
        };
    }

    let outcomes = regions
        .chunks(MAX_CONCURRENT_REGIONS)
        .flat_map(|batch| {
            thread::scope(|scope| {
                let workers = batch
                    .iter()
                    .map(|region| {
                        scope.spawn(move || transcriber.transcribe(document, Some(region)))
                    })
                    .collect::<Vec<_>>();
                workers
                    .into_iter()
                    .map(|worker| worker.join())
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let mut texts = Vec::new();
    for (region, outcome) in regions.iter().zip(outcomes) {
        match outcome {
            Ok(Ok(text)) => texts.push(text),
            Ok(Err(err)) => record_transcription_failure(transcriber, Some(region), &err, diagnostics),
            Err(_) => {
                let err = ServiceError::Unavailable("transcription worker panicked".to_string());
                record_transcription_failure(transcriber, Some(region), &err, diagnostics);
            }
        }
    }

    diagnostics.regions_transcribed = texts.len();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn record_transcription_failure(
    transcriber: &dyn Transcriber,
    region: Option<&RegionHint>,
    err: &ServiceError,
    diagnostics: &mut Diagnostics,
) {
    let region = region.map(RegionHint::as_str).unwrap_or("whole document");
    warn!(transcriber = transcriber.name(), region, error = %err, "transcription failed");
    diagnostics
        .warnings
        .push(format!("{} transcription of {region} failed: {err}", transcriber.name()));
}
