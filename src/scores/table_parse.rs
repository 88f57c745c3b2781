use regex::Captures;
use tracing::debug;

use super::classify::{LabelClassifier, LabelVerdict};
use super::layout::{LayoutDescriptor, SectionSpec};
use super::normalize::{normalize_whitespace, normalize_width, parse_loose_date, parse_number};
use super::ranges::assign_total_field;
use super::types::{TestCategory, TestRecord};

#[derive(Debug, Default)]
pub struct ParsedTable {
    pub records: Vec<TestRecord>,
    pub sections_found: usize,
    /// Rows that matched the row pattern but carried no usable date.
    pub skipped_rows: usize,
}

pub fn parse_with_layout(
    text: &str,
    descriptor: &LayoutDescriptor,
    classifier: &LabelClassifier,
) -> ParsedTable {
    let normalized = normalize_width(text);
    let mut parsed = ParsedTable::default();

    for section in &descriptor.sections {
        let Some(block) = section.slice(&normalized) else {
            continue;
        };
        parsed.sections_found += 1;

        for line in block.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(captures) = section.row.captures(line) else {
                continue;
            };

            match record_from_row(&captures, section, classifier) {
                Some(record) => parsed.records.push(record),
                None => {
                    parsed.skipped_rows += 1;
                    debug!(
                        layout = %descriptor.variant,
                        category = section.category.as_str(),
                        row = line,
                        "skipped row without a usable date"
                    );
                }
            }
        }
    }

    parsed
}

fn record_from_row(
    captures: &Captures<'_>,
    section: &SectionSpec,
    classifier: &LabelClassifier,
) -> Option<TestRecord> {
    let date_text = captures.name("date").map(|value| value.as_str())?;
    let loose_date = parse_loose_date(date_text)?;

    let round = captures
        .name("round")
        .and_then(|value| value.as_str().parse::<u32>().ok());
    let inline_name = captures
        .name("name")
        .map(|value| normalize_whitespace(value.as_str()))
        .filter(|value| !value.is_empty());

    let label = match (round, inline_name.as_deref()) {
        (Some(round), Some(name)) => format!("第{round}回 {name}"),
        (Some(round), None) => format!("第{round}回 {}", section.category.display_name()),
        (None, Some(name)) => name.to_string(),
        (None, None) => section.category.display_name().to_string(),
    };

    let category = match classifier.classify_label(Some(&label)) {
        LabelVerdict::Category(category) => category,
        LabelVerdict::ForcedOther => TestCategory::Other,
        LabelVerdict::Unrecognized => section.category,
    };

    let mut record = TestRecord::new(category, Some(label));
    record.round = round;
    record.occurred_on = Some(loose_date.date);
    record.date_precision = Some(loose_date.precision);

    for (index, column) in section.columns.iter().enumerate() {
        let value = captures
            .name(&format!("f{index}"))
            .and_then(|token| parse_number(token.as_str()));
        assign_total_field(&mut record, column.slot, column.field, value);
    }

    Some(record)
}
