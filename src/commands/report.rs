use anyhow::{Result, bail};
use tracing::info;

use crate::cli::ReportArgs;
use crate::commands::db::{load_latest_report, open_database};
use crate::scores::render_markdown;
use crate::services::DocumentHandle;
use crate::util::{write_json_pretty, write_text};

pub fn run(args: ReportArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("gradescan.sqlite"));
    if !db_path.exists() {
        bail!("database not found at {}; run extract first", db_path.display());
    }

    let connection = open_database(&db_path)?;
    let handle = DocumentHandle::new(args.document.trim());
    let Some(report) = load_latest_report(&connection, &handle)? else {
        bail!("no stored report for document {handle}");
    };

    info!(document = %handle, records = report.records.len(), ok = report.ok, "loaded report");

    match (&args.output, args.json) {
        (Some(path), true) => write_json_pretty(path, &report)?,
        (Some(path), false) => write_text(path, &render_markdown(&report))?,
        (None, true) => println!("{}", serde_json::to_string_pretty(&report)?),
        (None, false) => println!("{}", render_markdown(&report)),
    }

    Ok(())
}
