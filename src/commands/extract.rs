use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::{ExtractArgs, ExtractorKind, TranscriberKind};
use crate::commands::db::{
    DB_SCHEMA_VERSION, count_rows, open_database, persist_report, upsert_document,
};
use crate::model::{
    DocumentOutcome, ExtractCounts, ExtractPaths, ExtractRunManifest, ToolVersions,
};
use crate::scores::{DocumentReport, DocumentRequest, ReportPipeline, Services, render_markdown};
use crate::services::{
    LocalDocumentStore, OllamaClient, RegionHint, SchemaExtractor,
    TesseractTranscriber, TextFileTranscriber, Transcriber,
};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: ExtractArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("extract_run_{}.json", utc_compact_string(started_ts)))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("gradescan.sqlite"));

    info!(
        cache_root = %cache_root.display(),
        run_id = %run_id,
        documents = args.pdfs.len(),
        transcriber = args.transcriber.as_str(),
        extractor = args.extractor.as_str(),
        "starting extract"
    );

    let store = LocalDocumentStore::new(&cache_root);
    let ollama = match (args.transcriber, args.extractor) {
        (TranscriberKind::Ollama, _) | (_, ExtractorKind::Ollama) => Some(OllamaClient::new(
            &args.ollama_url,
            &args.ollama_model,
            args.ollama_timeout_secs,
        )?),
        _ => None,
    };
    let tesseract = TesseractTranscriber::new(args.ocr_lang.clone()).with_dpi(args.ocr_dpi);
    let text_file = match (args.transcriber, &args.transcript_path) {
        (TranscriberKind::TextFile, Some(path)) => Some(TextFileTranscriber::new(path)),
        (TranscriberKind::TextFile, None) => {
            bail!("--transcriber text-file requires --transcript-path")
        }
        _ => None,
    };

    let transcriber: Option<&dyn Transcriber> = match args.transcriber {
        TranscriberKind::Tesseract => Some(&tesseract as &dyn Transcriber),
        TranscriberKind::Ollama => ollama.as_ref().map(|client| client as &dyn Transcriber),
        TranscriberKind::TextFile => text_file.as_ref().map(|reader| reader as &dyn Transcriber),
        TranscriberKind::None => None,
    };
    let extractor: Option<&dyn SchemaExtractor> = match args.extractor {
        ExtractorKind::Ollama => ollama.as_ref().map(|client| client as &dyn SchemaExtractor),
        ExtractorKind::None => None,
    };
    let services = Services {
        store: &store,
        transcriber,
        extractor,
    };

    let pipeline = ReportPipeline::new()?;
    let mut connection = open_database(&db_path)?;
    let region_hints = args
        .regions
        .iter()
        .map(|region| RegionHint::new(region.clone()))
        .collect::<Vec<RegionHint>>();

    let mut outcomes = Vec::with_capacity(args.pdfs.len());
    let mut reports = Vec::new();
    let mut warnings = Vec::new();

    for pdf_path in &args.pdfs {
        match process_document(
            &pipeline,
            services,
            &mut connection,
            &run_id,
            pdf_path,
            &args,
            &region_hints,
        ) {
            Ok((report_id, report)) => {
                info!(
                    source = %pdf_path.display(),
                    ok = report.ok,
                    records = report.records.len(),
                    path = report.extraction_path.as_str(),
                    "processed document"
                );
                warnings.extend(
                    report
                        .diagnostics
                        .warnings
                        .iter()
                        .map(|warning| format!("{}: {warning}", pdf_path.display())),
                );
                outcomes.push(DocumentOutcome {
                    source_path: pdf_path.display().to_string(),
                    doc_id: report.document.as_ref().map(|handle| handle.to_string()),
                    report_id: Some(report_id),
                    ok: report.ok,
                    extraction_path: Some(report.extraction_path.as_str().to_string()),
                    layout_variant: report
                        .diagnostics
                        .layout
                        .as_ref()
                        .map(|selection| selection.chosen.to_string()),
                    records: report.records.len(),
                    error: report.error.clone(),
                });
                reports.push(report);
            }
            Err(err) => {
                warn!(source = %pdf_path.display(), error = %format!("{err:#}"), "document failed");
                outcomes.push(DocumentOutcome {
                    source_path: pdf_path.display().to_string(),
                    doc_id: None,
                    report_id: None,
                    ok: false,
                    extraction_path: None,
                    layout_variant: None,
                    records: 0,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }

    if let Some(path) = &args.json_out {
        write_json_pretty(path, &reports)?;
        info!(path = %path.display(), reports = reports.len(), "wrote report json");
    }
    if args.markdown {
        for report in &reports {
            println!("{}", render_markdown(report));
        }
    }

    let counts = ExtractCounts {
        documents_requested: args.pdfs.len(),
        documents_processed: reports.len(),
        documents_ok: reports.iter().filter(|report| report.ok).count(),
        documents_failed: outcomes.iter().filter(|outcome| !outcome.ok).count(),
        records_total: reports.iter().map(|report| report.records.len()).sum(),
        reports_in_db: count_rows(&connection, "SELECT COUNT(*) FROM reports")?,
        test_records_in_db: count_rows(&connection, "SELECT COUNT(*) FROM test_records")?,
    };

    let manifest = ExtractRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: if counts.documents_failed == 0 {
            "completed".to_string()
        } else {
            "completed_with_failures".to_string()
        },
        started_at,
        updated_at: now_utc_string(),
        command: render_extract_command(&args),
        transcriber: args.transcriber.as_str().to_string(),
        extractor: args.extractor.as_str().to_string(),
        tool_versions: collect_tool_versions(),
        paths: ExtractPaths {
            cache_root: cache_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts,
        documents: outcomes,
        warnings,
    };

    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote extract run manifest");
    info!(
        documents = manifest.counts.documents_requested,
        ok = manifest.counts.documents_ok,
        failed = manifest.counts.documents_failed,
        records = manifest.counts.records_total,
        "extract completed"
    );

    Ok(())
}

fn process_document(
    pipeline: &ReportPipeline,
    services: Services<'_>,
    connection: &mut Connection,
    run_id: &str,
    pdf_path: &Path,
    args: &ExtractArgs,
    region_hints: &[RegionHint],
) -> Result<(i64, DocumentReport)> {
    let bytes =
        fs::read(pdf_path).with_context(|| format!("failed to read {}", pdf_path.display()))?;
    let name = pdf_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("document.pdf");

    let handle = services
        .store
        .put(&bytes, name)
        .with_context(|| format!("failed to store {}", pdf_path.display()))?;
    upsert_document(connection, &handle, name, bytes.len())?;

    let request = DocumentRequest {
        handle,
        layout: args.layout.hint(),
        region_hints: region_hints.to_vec(),
    };
    let report = pipeline.process(services, &request)?;
    let report_id = persist_report(connection, run_id, &report)?;

    Ok((report_id, report))
}

fn collect_tool_versions() -> ToolVersions {
    ToolVersions {
        pdftoppm: command_version_optional("pdftoppm", &["-v"]),
        tesseract: command_version_optional("tesseract", &["--version"]),
    }
}

/// pdftoppm prints its version to stderr, tesseract to stdout.
fn command_version_optional(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn render_extract_command(args: &ExtractArgs) -> String {
    let mut command = vec![
        "gradescan".to_string(),
        "extract".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.manifest_path {
        command.push("--manifest-path".to_string());
        command.push(path.display().to_string());
    }
    command.push("--layout".to_string());
    command.push(args.layout.as_str().to_string());
    command.push("--transcriber".to_string());
    command.push(args.transcriber.as_str().to_string());
    command.push("--extractor".to_string());
    command.push(args.extractor.as_str().to_string());
    for region in &args.regions {
        command.push("--region".to_string());
        command.push(region.clone());
    }
    if let Some(path) = &args.transcript_path {
        command.push("--transcript-path".to_string());
        command.push(path.display().to_string());
    }
    if args.transcriber == TranscriberKind::Tesseract {
        command.push("--ocr-lang".to_string());
        command.push(args.ocr_lang.clone());
        command.push("--ocr-dpi".to_string());
        command.push(args.ocr_dpi.to_string());
    }
    if args.transcriber == TranscriberKind::Ollama || args.extractor == ExtractorKind::Ollama {
        command.push("--ollama-model".to_string());
        command.push(args.ollama_model.clone());
        command.push("--ollama-timeout-secs".to_string());
        command.push(args.ollama_timeout_secs.to_string());
    }
    if let Some(path) = &args.json_out {
        command.push("--json-out".to_string());
        command.push(path.display().to_string());
    }
    if args.markdown {
        command.push("--markdown".to_string());
    }
    for pdf in &args.pdfs {
        command.push(pdf.display().to_string());
    }

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cli::LayoutArg;
    use crate::services::ollama::DEFAULT_OLLAMA_URL;
    use crate::services::render::DEFAULT_RENDER_DPI;

    fn args(cache_root: &Path, pdfs: Vec<PathBuf>, transcript: &Path) -> ExtractArgs {
        ExtractArgs {
            cache_root: cache_root.to_path_buf(),
            db_path: None,
            manifest_path: Some(cache_root.join("manifests/run.json")),
            pdfs,
            layout: LayoutArg::Auto,
            transcriber: TranscriberKind::TextFile,
            extractor: ExtractorKind::None,
            regions: Vec::new(),
            transcript_path: Some(transcript.to_path_buf()),
            ocr_lang: "jpn+eng".to_string(),
            ocr_dpi: DEFAULT_RENDER_DPI,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: "qwen2.5vl".to_string(),
            ollama_timeout_secs: 30,
            json_out: None,
            markdown: false,
        }
    }

    #[test]
    fn one_unreadable_document_does_not_stop_the_run() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let transcript = scratch.path().join("report.txt");
        fs::write(&transcript, "育成テスト\n第1回 2024/04/14 300 6 190 6\n").expect("transcript");
        let pdf = scratch.path().join("report.pdf");
        fs::write(&pdf, b"%PDF-1.7 fake").expect("pdf");

        let cache_root = scratch.path().join("cache");
        let run_args = args(
            &cache_root,
            vec![scratch.path().join("missing.pdf"), pdf],
            &transcript,
        );
        run(run_args).expect("extract run");

        let raw = fs::read(cache_root.join("manifests/run.json")).expect("manifest");
        let manifest: ExtractRunManifest = serde_json::from_slice(&raw).expect("manifest json");
        assert_eq!(manifest.status, "completed_with_failures");
        assert_eq!(manifest.counts.documents_requested, 2);
        assert_eq!(manifest.counts.documents_ok, 1);
        assert_eq!(manifest.counts.documents_failed, 1);
        assert_eq!(manifest.counts.records_total, 1);
        assert_eq!(manifest.counts.reports_in_db, 1);
        assert!(manifest.documents[0].error.is_some());
        assert!(manifest.documents[1].doc_id.is_some());
    }

    #[test]
    fn text_file_transcriber_requires_a_path() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut run_args = args(scratch.path(), vec![], scratch.path());
        run_args.transcript_path = None;
        assert!(run(run_args).is_err());
    }

    #[test]
    fn rendered_command_lists_regions_and_sources() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut run_args = args(
            Path::new(".cache/gradescan"),
            vec![PathBuf::from("a.pdf")],
            scratch.path(),
        );
        run_args.manifest_path = None;
        run_args.regions = vec!["page 2".to_string()];
        let command = render_extract_command(&run_args);
        assert!(command.starts_with("gradescan extract --cache-root .cache/gradescan"));
        assert!(command.contains("--region page 2"));
        assert!(command.ends_with("a.pdf"));
    }

    #[test]
    fn rendered_command_carries_the_ocr_resolution() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut run_args = args(scratch.path(), vec![PathBuf::from("a.pdf")], scratch.path());
        run_args.transcriber = TranscriberKind::Tesseract;
        run_args.transcript_path = None;
        run_args.ocr_dpi = 300;
        let command = render_extract_command(&run_args);
        assert!(command.contains("--ocr-lang jpn+eng --ocr-dpi 300"));
    }
}
