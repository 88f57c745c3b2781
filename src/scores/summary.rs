use std::fmt::Write;

use super::pipeline::DocumentReport;
use super::trend::{TrendSummary, TrendVerdict};
use super::types::{TestCategory, TestRecord, TotalSlot};

/// Deterministic markdown digest of one report: a table per category, its trend line,
/// and every annotation the reconciler left behind.
pub fn render_markdown(report: &DocumentReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Score Report");
    let _ = writeln!(
        output,
        "Document: {} | Path: {} | Records: {}",
        report
            .document
            .as_ref()
            .map(|handle| handle.as_str())
            .unwrap_or("(transcript)"),
        report.extraction_path.as_str(),
        report.records.len()
    );
    if let Some(layout) = &report.diagnostics.layout {
        let _ = writeln!(output, "Layout: {} ({})", layout.chosen, layout.basis.as_str());
    }
    if let Some(error) = &report.error {
        let _ = writeln!(output);
        let _ = writeln!(output, "**No result:** {error}");
    }

    for category in [TestCategory::PeriodicGrowth, TestCategory::OpenMock] {
        let records = report
            .records
            .iter()
            .filter(|record| record.category == category)
            .collect::<Vec<&TestRecord>>();
        if records.is_empty() {
            continue;
        }

        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", category.display_name());
        let _ = writeln!(output);
        render_table(&mut output, category, &records);

        if let Some(trend) = report.trends.iter().find(|trend| trend.category == category) {
            let _ = writeln!(output);
            let _ = writeln!(output, "{}", trend_line(trend));
        }
    }

    let notes = report
        .records
        .iter()
        .flat_map(|record| {
            record.annotations.iter().map(move |note| {
                format!("{}: {note}", record.label.as_deref().unwrap_or("(unlabeled)"))
            })
        })
        .chain(report.diagnostics.warnings.iter().cloned())
        .collect::<Vec<String>>();
    if !notes.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Notes");
        for note in notes {
            let _ = writeln!(output, "- {note}");
        }
    }

    output
}

fn render_table(output: &mut String, category: TestCategory, records: &[&TestRecord]) {
    let marker = match category {
        TestCategory::OpenMock => "deviation",
        _ => "grade",
    };
    let _ = writeln!(
        output,
        "| Test | Date | 4-subject | 4-subject {marker} | 2-subject | 2-subject {marker} |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|");

    for record in records {
        let totals = &record.combined_totals;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} |",
            record.label.as_deref().unwrap_or("-"),
            record
                .occurred_on
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string()),
            render_value(totals.four_subject.raw_score),
            render_marker(category, &totals.four_subject),
            render_value(totals.two_subject.raw_score),
            render_marker(category, &totals.two_subject),
        );
    }
}

fn render_marker(category: TestCategory, slot: &TotalSlot) -> String {
    match category {
        TestCategory::OpenMock => render_value(slot.percentile_deviation),
        _ => slot
            .grade_level
            .map(|grade| grade.to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn render_value(value: Option<f64>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn trend_line(trend: &TrendSummary) -> String {
    match (trend.verdict, trend.first, trend.last) {
        (TrendVerdict::Indeterminate, _, _) | (_, None, _) | (_, _, None) => format!(
            "Trend ({}): indeterminate, {} value(s)",
            trend.metric.as_str(),
            trend.values.len()
        ),
        (verdict, Some(first), Some(last)) => format!(
            "Trend ({}): {} from {first} to {last} over {} tests",
            trend.metric.as_str(),
            verdict.as_str(),
            trend.values.len()
        ),
    }
}
