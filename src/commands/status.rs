use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::db::{count_rows, open_database};
use crate::model::ExtractRunManifest;
use crate::services::LocalDocumentStore;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("gradescan.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    let store = LocalDocumentStore::new(&args.cache_root);
    info!(documents = store.count(), "document store status");

    match latest_manifest_path(&manifest_dir) {
        Some(path) => {
            let raw =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: ExtractRunManifest = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            info!(
                run_id = %manifest.run_id,
                status = %manifest.status,
                started_at = %manifest.started_at,
                updated_at = %manifest.updated_at,
                transcriber = %manifest.transcriber,
                extractor = %manifest.extractor,
                documents = manifest.counts.documents_requested,
                ok = manifest.counts.documents_ok,
                failed = manifest.counts.documents_failed,
                records = manifest.counts.records_total,
                "loaded latest extract manifest"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no extract manifest found"),
    }

    if db_path.exists() {
        let connection = open_database(&db_path)?;
        let documents = count_rows(&connection, "SELECT COUNT(*) FROM documents").unwrap_or(0);
        let reports = count_rows(&connection, "SELECT COUNT(*) FROM reports").unwrap_or(0);
        let failed = count_rows(&connection, "SELECT COUNT(*) FROM reports WHERE ok = 0").unwrap_or(0);
        let records = count_rows(&connection, "SELECT COUNT(*) FROM test_records").unwrap_or(0);

        info!(
            path = %db_path.display(),
            documents,
            reports,
            failed_reports = failed,
            records,
            "database status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

/// Manifest names carry a compact UTC stamp, so the lexicographic maximum is the newest.
fn latest_manifest_path(manifest_dir: &Path) -> Option<PathBuf> {
    fs::read_dir(manifest_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|value| value.to_str())
                .is_some_and(|name| name.starts_with("extract_run_") && name.ends_with(".json"))
        })
        .max()
}
