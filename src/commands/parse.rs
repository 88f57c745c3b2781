use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ParseArgs;
use crate::scores::{ReportPipeline, render_markdown};
use crate::util::{write_json_pretty, write_text};

/// Offline run over an existing transcript: no document store, no external services.
pub fn run(args: ParseArgs) -> Result<()> {
    let text = fs::read_to_string(&args.transcript)
        .with_context(|| format!("failed to read {}", args.transcript.display()))?;

    let pipeline = ReportPipeline::new()?;
    let report = pipeline.process_text(&text, args.layout.hint());

    info!(
        transcript = %args.transcript.display(),
        layout = args.layout.as_str(),
        ok = report.ok,
        records = report.records.len(),
        skipped_rows = report.diagnostics.skipped_rows,
        "parsed transcript"
    );

    match (&args.output, args.markdown) {
        (Some(path), true) => write_text(path, &render_markdown(&report))?,
        (Some(path), false) => write_json_pretty(path, &report)?,
        (None, true) => println!("{}", render_markdown(&report)),
        (None, false) => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::LayoutArg;
    use crate::scores::DocumentReport;

    #[test]
    fn writes_the_report_json_for_a_transcript() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let transcript = scratch.path().join("report.txt");
        fs::write(
            &transcript,
            "公開模試\n第1回 2024/07/07 310 55.2 190 54.0\n第2回 2024/09/01 330 56.0 205 56.5\n備考\n",
        )
        .expect("transcript");
        let output = scratch.path().join("out/report.json");

        run(ParseArgs {
            transcript,
            layout: LayoutArg::RoundFirst,
            output: Some(output.clone()),
            markdown: false,
        })
        .expect("parse run");

        let raw = fs::read(&output).expect("output");
        let report: DocumentReport = serde_json::from_slice(&raw).expect("report json");
        assert!(report.ok);
        assert_eq!(report.records.len(), 2);
        assert_eq!(
            report.records[0].combined_totals.four_subject.percentile_deviation,
            Some(55.2)
        );
    }
}
