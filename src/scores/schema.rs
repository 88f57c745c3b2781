//! Boundary between the schema-constrained extraction service and typed records.
//!
//! The service answers with JSON that is supposed to follow [`extraction_schema`]. Anything
//! untyped stays inside this module: the payload is validated here and converted into
//! provisional [`TestRecord`]s, or rejected with the raw text kept for diagnosis.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::classify::LabelClassifier;
use super::normalize::{normalize_whitespace, parse_loose_date, parse_number};
use super::ranges::{admit_grade, admit_rank};
use super::types::{Subject, SubjectScore, TestCategory, TestRecord, TotalSlot};

#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("extraction output is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("extraction output is missing the `tests` array")]
    MissingTests,
}

pub fn extraction_schema() -> Value {
    let total = json!({
        "type": ["object", "null"],
        "properties": {
            "score": {"type": ["number", "string", "null"]},
            "deviation": {"type": ["number", "string", "null"]},
            "rank": {"type": ["number", "string", "null"]},
            "average": {"type": ["number", "string", "null"]},
            "average_diff": {"type": ["number", "string", "null"]},
            "grade": {"type": ["number", "string", "null"]}
        }
    });

    json!({
        "type": "object",
        "required": ["tests"],
        "properties": {
            "tests": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["test_type"],
                    "properties": {
                        "test_type": {"type": "string"},
                        "test_name": {"type": ["string", "null"]},
                        "date": {"type": ["string", "null"]},
                        "subjects": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "subject": {"type": "string"},
                                    "score": {"type": ["number", "string", "null"]},
                                    "deviation": {"type": ["number", "string", "null"]},
                                    "rank": {"type": ["number", "string", "null"]},
                                    "average": {"type": ["number", "string", "null"]},
                                    "average_diff": {"type": ["number", "string", "null"]}
                                }
                            }
                        },
                        "two_subject": total.clone(),
                        "four_subject": total
                    }
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    tests: Option<Vec<Value>>,
}

/// Every field stays untyped so a single mistyped value degrades to null instead of
/// discarding the whole entry.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTest {
    test_type: Option<Value>,
    test_name: Option<Value>,
    date: Option<Value>,
    subjects: Option<Value>,
    two_subject: Option<Value>,
    four_subject: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTotal {
    score: Option<Value>,
    deviation: Option<Value>,
    rank: Option<Value>,
    average: Option<Value>,
    average_diff: Option<Value>,
    grade: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSubject {
    subject: Option<Value>,
    score: Option<Value>,
    deviation: Option<Value>,
    rank: Option<Value>,
    average: Option<Value>,
    average_diff: Option<Value>,
}

/// Records coerced from one payload, plus the `tests` entries that were not objects.
#[derive(Debug)]
pub struct CoercedPayload {
    pub records: Vec<TestRecord>,
    pub skipped_entries: usize,
}

/// Models like to wrap JSON in a fenced block; take the fenced body when present.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };

    let after_fence = &trimmed[start + 3..];
    let body_start = after_fence.find('\n').map(|index| index + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mistyped(field: &str, value: &Value, notes: &mut Vec<String>) {
    notes.push(format!(
        "{field} had unexpected JSON type {}; left empty",
        json_kind(value)
    ));
}

fn coerce_number(value: Option<&Value>, field: &str, notes: &mut Vec<String>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64().filter(|parsed| parsed.is_finite()),
        Value::String(text) => parse_number(text),
        Value::Null => None,
        other => {
            mistyped(field, other, notes);
            None
        }
    }
}

fn coerce_text(value: Option<Value>, field: &str, notes: &mut Vec<String>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text),
        Value::Null => None,
        other => {
            mistyped(field, &other, notes);
            None
        }
    }
}

fn coerce_object<T: DeserializeOwned>(
    value: Option<Value>,
    field: &str,
    notes: &mut Vec<String>,
) -> Option<T> {
    match value? {
        Value::Null => None,
        object @ Value::Object(_) => match serde_json::from_value(object) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                notes.push(format!("{field} could not be read ({err}); left empty"));
                None
            }
        },
        other => {
            mistyped(field, &other, notes);
            None
        }
    }
}

pub fn records_from_payload(
    raw: &str,
    classifier: &LabelClassifier,
) -> Result<CoercedPayload, SchemaViolation> {
    let payload: RawPayload = serde_json::from_str(strip_code_fence(raw))
        .map_err(|err| SchemaViolation::InvalidJson(err.to_string()))?;
    let tests = payload.tests.ok_or(SchemaViolation::MissingTests)?;

    let mut coerced = CoercedPayload {
        records: Vec::with_capacity(tests.len()),
        skipped_entries: 0,
    };
    for value in tests {
        if !value.is_object() {
            debug!(kind = json_kind(&value), "skipped non-object tests entry");
            coerced.skipped_entries += 1;
            continue;
        }
        match serde_json::from_value::<RawTest>(value) {
            Ok(test) => coerced.records.push(record_from_test(test, classifier)),
            Err(err) => {
                debug!(error = %err, "skipped unreadable tests entry");
                coerced.skipped_entries += 1;
            }
        }
    }

    Ok(coerced)
}

fn record_from_test(test: RawTest, classifier: &LabelClassifier) -> TestRecord {
    let mut notes = Vec::new();
    let declared_type = coerce_text(test.test_type, "test_type", &mut notes)
        .map(|value| normalize_whitespace(&value))
        .filter(|value| !value.is_empty());
    let test_name = coerce_text(test.test_name, "test_name", &mut notes)
        .map(|value| normalize_whitespace(&value))
        .filter(|value| !value.is_empty());

    let label = test_name.or_else(|| declared_type.clone());
    let mut record = TestRecord::new(TestCategory::Other, label);
    record.declared_type = declared_type;

    if let Some(date_text) = coerce_text(test.date, "date", &mut notes) {
        match parse_loose_date(&date_text) {
            Some(loose) => {
                record.occurred_on = Some(loose.date);
                record.date_precision = Some(loose.precision);
            }
            None => notes.push(format!("unparseable date '{date_text}' left empty")),
        }
    }

    let two_subject = coerce_object::<RawTotal>(test.two_subject, "2-subject total", &mut notes);
    let four_subject =
        coerce_object::<RawTotal>(test.four_subject, "4-subject total", &mut notes);
    record.combined_totals.two_subject =
        total_from_raw(two_subject.unwrap_or_default(), "2-subject", &mut notes);
    record.combined_totals.four_subject =
        total_from_raw(four_subject.unwrap_or_default(), "4-subject", &mut notes);

    match test.subjects {
        None | Some(Value::Null) => {}
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(subject) =
                    coerce_object::<RawSubject>(Some(entry), "subject entry", &mut notes)
                {
                    let score = subject_from_raw(subject, &mut notes);
                    record.subject_scores.push(score);
                }
            }
        }
        Some(other) => mistyped("subjects", &other, &mut notes),
    }
    record.annotations.extend(notes);

    record.category = classifier.classify(&record);
    record
}

fn total_from_raw(raw: RawTotal, slot: &str, notes: &mut Vec<String>) -> TotalSlot {
    let rank = coerce_number(raw.rank.as_ref(), &format!("{slot} rank"), notes);
    let grade = coerce_number(raw.grade.as_ref(), &format!("{slot} grade"), notes);
    TotalSlot {
        raw_score: coerce_number(raw.score.as_ref(), &format!("{slot} score"), notes),
        percentile_deviation: coerce_number(
            raw.deviation.as_ref(),
            &format!("{slot} deviation"),
            notes,
        ),
        rank: admit_rank(rank, &format!("{slot} rank"), notes),
        average: coerce_number(raw.average.as_ref(), &format!("{slot} average"), notes),
        average_delta: coerce_number(
            raw.average_diff.as_ref(),
            &format!("{slot} average delta"),
            notes,
        ),
        grade_level: admit_grade(grade, &format!("{slot} grade level"), notes),
    }
}

fn subject_from_raw(raw: RawSubject, notes: &mut Vec<String>) -> SubjectScore {
    let subject = coerce_text(raw.subject, "subject name", notes)
        .as_deref()
        .map(Subject::from_label)
        .unwrap_or(Subject::Unknown);
    let what = subject.as_str();

    let rank = coerce_number(raw.rank.as_ref(), &format!("{what} rank"), notes);
    SubjectScore {
        subject,
        raw_score: coerce_number(raw.score.as_ref(), &format!("{what} score"), notes),
        percentile_deviation: coerce_number(
            raw.deviation.as_ref(),
            &format!("{what} deviation"),
            notes,
        ),
        rank: admit_rank(rank, &format!("{what} rank"), notes),
        average: coerce_number(raw.average.as_ref(), &format!("{what} average"), notes),
        average_delta: coerce_number(
            raw.average_diff.as_ref(),
            &format!("{what} average delta"),
            notes,
        ),
    }
}
