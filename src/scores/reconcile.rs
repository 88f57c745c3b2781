use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::classify::LabelClassifier;
use super::ranges::{MISPLACED_FOUR_SUBJECT, TWO_SUBJECT_SCORE, sweep_record};
use super::types::{CombinedTotals, SlotKind, SubjectScore, TestCategory, TestRecord, TotalSlot};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub records_in: usize,
    pub exclusive_fields_nulled: usize,
    pub empty_totals_reset: usize,
    pub column_swaps: usize,
    pub suspicious_scores_suppressed: usize,
    pub grade_levels_derived: usize,
    pub reclassified: usize,
    pub dropped_other: usize,
    pub duplicates_removed: usize,
    pub records_out: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub records: Vec<TestRecord>,
    pub stats: ReconcileStats,
}

/// Best-effort repair pass over provisional records. Never rejects a document; every
/// change it makes is written to the record's annotations.
pub fn reconcile(records: Vec<TestRecord>, classifier: &LabelClassifier) -> Reconciled {
    let mut stats = ReconcileStats {
        records_in: records.len(),
        ..ReconcileStats::default()
    };

    let mut repaired = Vec::with_capacity(records.len());
    for mut record in records {
        if null_exclusive_fields(&mut record) {
            stats.exclusive_fields_nulled += 1;
        }
        stats.empty_totals_reset += reset_empty_totals(&mut record);
        if repair_column_swap(&mut record) {
            stats.column_swaps += 1;
        }
        if suppress_suspicious_mock_score(&mut record) {
            stats.suspicious_scores_suppressed += 1;
        }
        sweep_record(&mut record);
        stats.grade_levels_derived += derive_grade_levels(&mut record);

        let category = classifier.reclassify(&record);
        if category != record.category {
            record.annotate(format!(
                "reclassified from {} to {}",
                record.category.as_str(),
                category.as_str()
            ));
            record.category = category;
            stats.reclassified += 1;
            null_exclusive_fields(&mut record);
        }

        if record.category == TestCategory::Other {
            debug!(label = ?record.label, "dropped record outside the test catalog");
            stats.dropped_other += 1;
            continue;
        }

        repaired.push(record);
    }

    let before_dedup = repaired.len();
    let mut records = deduplicate(repaired);
    stats.duplicates_removed = before_dedup - records.len();

    sort_canonical(&mut records);
    stats.records_out = records.len();

    Reconciled { records, stats }
}

/// Grade levels belong to periodic-growth tests, deviations to open mocks.
pub fn null_exclusive_fields(record: &mut TestRecord) -> bool {
    let mut nulled = Vec::new();

    match record.category {
        TestCategory::PeriodicGrowth => {
            for kind in [SlotKind::TwoSubject, SlotKind::FourSubject] {
                let slot = record.combined_totals.slot_mut(kind);
                if let Some(deviation) = slot.percentile_deviation.take() {
                    nulled.push(format!("{} deviation {deviation}", kind.as_str()));
                }
            }
            for entry in &mut record.subject_scores {
                if let Some(deviation) = entry.percentile_deviation.take() {
                    nulled.push(format!("{} deviation {deviation}", entry.subject.as_str()));
                }
            }
        }
        TestCategory::OpenMock => {
            for kind in [SlotKind::TwoSubject, SlotKind::FourSubject] {
                let slot = record.combined_totals.slot_mut(kind);
                if let Some(grade) = slot.grade_level.take() {
                    nulled.push(format!("{} grade level {grade}", kind.as_str()));
                }
            }
        }
        TestCategory::Other => {}
    }

    if nulled.is_empty() {
        return false;
    }

    let note = format!(
        "nulled {} for a {} record: {}",
        if nulled.len() == 1 { "field" } else { "fields" },
        record.category.as_str(),
        nulled.join(", ")
    );
    record.annotate(note);
    true
}

pub fn reset_empty_totals(record: &mut TestRecord) -> usize {
    let mut reset = 0;
    for kind in [SlotKind::TwoSubject, SlotKind::FourSubject] {
        let slot = record.combined_totals.slot_mut(kind);
        if slot.is_empty() && *slot != TotalSlot::default() {
            *slot = TotalSlot::default();
            record.annotate(format!("reset {} total with no usable values", kind.as_str()));
            reset += 1;
        }
    }
    reset
}

/// Periodic-growth tables frequently land the 4-subject total in the 2-subject column.
pub fn repair_column_swap(record: &mut TestRecord) -> bool {
    if record.category != TestCategory::PeriodicGrowth {
        return false;
    }

    let two = record.combined_totals.two_subject.raw_score;
    let four = record.combined_totals.four_subject.raw_score;

    let misplaced_total = two.is_some_and(|score| MISPLACED_FOUR_SUBJECT.contains(score))
        && four.is_none_or(|score| TWO_SUBJECT_SCORE.contains(score));
    let inverted_totals = matches!((four, two), (Some(four), Some(two)) if four <= 170.0 && two >= 220.0);

    if !misplaced_total && !inverted_totals {
        return false;
    }

    swap_scores_and_grades(&mut record.combined_totals);
    let reason = if misplaced_total {
        "2-subject score in the 4-subject range"
    } else {
        "4-subject score below the 2-subject score"
    };
    record.annotate(format!(
        "swapped 2-subject and 4-subject scores and grade levels ({reason}): 2-subject {} / 4-subject {}",
        render_optional(record.combined_totals.two_subject.raw_score),
        render_optional(record.combined_totals.four_subject.raw_score)
    ));
    true
}

fn swap_scores_and_grades(totals: &mut CombinedTotals) {
    let CombinedTotals {
        two_subject,
        four_subject,
    } = totals;
    std::mem::swap(&mut two_subject.raw_score, &mut four_subject.raw_score);
    std::mem::swap(&mut two_subject.grade_level, &mut four_subject.grade_level);
}

/// A 4-subject mock score of 1-20 is a date fragment read as a score.
pub fn suppress_suspicious_mock_score(record: &mut TestRecord) -> bool {
    if record.category != TestCategory::OpenMock {
        return false;
    }

    let slot = &mut record.combined_totals.four_subject;
    let Some(score) = slot.raw_score.filter(|score| (1.0..=20.0).contains(score)) else {
        return false;
    };

    slot.raw_score = None;
    let deviation = slot.percentile_deviation.take();
    record.annotate(format!(
        "suppressed 4-subject score {score} and deviation {} as a likely misread date fragment",
        render_optional(deviation)
    ));
    true
}

/// The periodic-growth grade scale is defined by distance from the administration
/// average, so the tier follows directly from the delta.
pub fn grade_level_for_delta(delta: f64) -> u8 {
    if delta >= 8.0 {
        10
    } else if delta >= 6.0 {
        9
    } else if delta >= 4.0 {
        8
    } else if delta >= 2.0 {
        7
    } else if delta >= 1.0 {
        6
    } else if delta >= -1.0 {
        5
    } else if delta >= -3.0 {
        4
    } else {
        3
    }
}

pub fn derive_grade_levels(record: &mut TestRecord) -> usize {
    if record.category == TestCategory::OpenMock {
        return 0;
    }

    let mut derived = Vec::new();
    for kind in [SlotKind::TwoSubject, SlotKind::FourSubject] {
        let slot = record.combined_totals.slot_mut(kind);
        if slot.grade_level.is_some() {
            continue;
        }
        if let Some(delta) = slot.average_delta {
            let grade = grade_level_for_delta(delta);
            slot.grade_level = Some(grade);
            derived.push(format!(
                "derived {} grade level {grade} from average delta {delta}",
                kind.as_str()
            ));
        }
    }

    let count = derived.len();
    record.annotations.extend(derived);
    count
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    category: TestCategory,
    label: Option<&'a str>,
    occurred_on: Option<NaiveDate>,
    subject_scores: Vec<&'a SubjectScore>,
    combined_totals: &'a CombinedTotals,
    annotations: &'a [String],
}

pub fn fingerprint(record: &TestRecord) -> String {
    let mut subject_scores = record.subject_scores.iter().collect::<Vec<&SubjectScore>>();
    subject_scores.sort_by_key(|entry| entry.subject.as_str());

    let payload = Fingerprint {
        category: record.category,
        label: record.label.as_deref(),
        occurred_on: record.occurred_on,
        subject_scores,
        combined_totals: &record.combined_totals,
        annotations: &record.annotations,
    };

    let bytes =
        serde_json::to_vec(&payload).unwrap_or_else(|_| format!("{record:?}").into_bytes());

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

pub fn deduplicate(records: Vec<TestRecord>) -> Vec<TestRecord> {
    let mut seen = HashSet::<String>::new();
    records
        .into_iter()
        .filter(|record| seen.insert(fingerprint(record)))
        .collect()
}

/// Periodic-growth, then open-mock, then anything left; ties by label. The sort is
/// stable so equal labels keep their source order.
pub fn sort_canonical(records: &mut [TestRecord]) {
    records.sort_by(|left, right| {
        left.category
            .sort_rank()
            .cmp(&right.category.sort_rank())
            .then_with(|| left.label.cmp(&right.label))
    });
}

fn render_optional(value: Option<f64>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "null".to_string())
}
