use super::normalize::clamp_to_range;
use super::types::{SlotKind, TestCategory, TestRecord, TotalField, TotalSlot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRange {
    pub min: f64,
    pub max: f64,
}

impl FieldRange {
    const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(self, value: f64) -> bool {
        clamp_to_range(value, self.min, self.max).is_some()
    }
}

pub const TWO_SUBJECT_SCORE: FieldRange = FieldRange::new(0.0, 400.0);
pub const FOUR_SUBJECT_SCORE: FieldRange = FieldRange::new(0.0, 500.0);
pub const SUBJECT_SCORE: FieldRange = FieldRange::new(0.0, 200.0);
pub const PERCENTILE_DEVIATION: FieldRange = FieldRange::new(10.0, 90.0);
pub const SUBJECT_AVERAGE_DELTA: FieldRange = FieldRange::new(-200.0, 200.0);
pub const TWO_SUBJECT_AVERAGE_DELTA: FieldRange = FieldRange::new(-400.0, 400.0);
pub const FOUR_SUBJECT_AVERAGE_DELTA: FieldRange = FieldRange::new(-500.0, 500.0);
pub const RANK: FieldRange = FieldRange::new(1.0, 100_000.0);

pub const GRADE_LEVEL_MIN: u8 = 3;
pub const GRADE_LEVEL_MAX: u8 = 10;

/// Two-subject scores in this band are four-subject totals read into the wrong column.
pub const MISPLACED_FOUR_SUBJECT: FieldRange = FieldRange::new(401.0, 500.0);

pub fn score_range(slot: SlotKind) -> FieldRange {
    match slot {
        SlotKind::TwoSubject => TWO_SUBJECT_SCORE,
        SlotKind::FourSubject => FOUR_SUBJECT_SCORE,
    }
}

pub fn average_delta_range(slot: SlotKind) -> FieldRange {
    match slot {
        SlotKind::TwoSubject => TWO_SUBJECT_AVERAGE_DELTA,
        SlotKind::FourSubject => FOUR_SUBJECT_AVERAGE_DELTA,
    }
}

/// Keeps `value` when it is inside `range`; otherwise records why it was dropped.
pub fn admit(
    value: Option<f64>,
    range: FieldRange,
    what: &str,
    annotations: &mut Vec<String>,
) -> Option<f64> {
    let value = value?;
    if range.contains(value) {
        return Some(value);
    }

    annotations.push(format!(
        "{what} {value} outside {}..{}; nulled",
        range.min, range.max
    ));
    None
}

pub fn admit_rank(value: Option<f64>, what: &str, annotations: &mut Vec<String>) -> Option<u32> {
    let value = admit(value, RANK, what, annotations)?;
    if value.fract() != 0.0 {
        annotations.push(format!("{what} {value} is not a whole rank; nulled"));
        return None;
    }
    Some(value as u32)
}

/// Grade levels start at 3; a 1 or 2 is almost always an OCR confusion, so it is
/// surfaced with its own note instead of being folded into the generic range message.
pub fn admit_grade(value: Option<f64>, what: &str, annotations: &mut Vec<String>) -> Option<u8> {
    let value = value?;
    if value == 1.0 || value == 2.0 {
        annotations.push(format!(
            "{what} {value} is below the {GRADE_LEVEL_MIN}-{GRADE_LEVEL_MAX} scale; likely misread, nulled"
        ));
        return None;
    }

    if value.fract() != 0.0
        || value < f64::from(GRADE_LEVEL_MIN)
        || value > f64::from(GRADE_LEVEL_MAX)
    {
        annotations.push(format!(
            "{what} {value} outside {GRADE_LEVEL_MIN}..{GRADE_LEVEL_MAX}; nulled"
        ));
        return None;
    }

    Some(value as u8)
}

/// Applies the range table to one captured total field and stores the result.
pub fn assign_total_field(
    record: &mut TestRecord,
    slot: SlotKind,
    field: TotalField,
    value: Option<f64>,
) {
    let what = format!("{} {}", slot.as_str(), field.as_str());
    let mut notes = Vec::new();

    match field {
        TotalField::RawScore => {
            let held = record.category == TestCategory::PeriodicGrowth
                && slot == SlotKind::TwoSubject
                && value.is_some_and(|score| MISPLACED_FOUR_SUBJECT.contains(score));
            let admitted = if held {
                notes.push(format!(
                    "{what} {} is in the 4-subject range; held for column-swap check",
                    value.unwrap_or_default()
                ));
                value
            } else {
                admit(value, score_range(slot), &what, &mut notes)
            };
            record.combined_totals.slot_mut(slot).raw_score = admitted;
        }
        TotalField::AverageDelta => {
            record.combined_totals.slot_mut(slot).average_delta =
                admit(value, average_delta_range(slot), &what, &mut notes);
        }
        TotalField::PercentileDeviation => {
            record.combined_totals.slot_mut(slot).percentile_deviation =
                admit(value, PERCENTILE_DEVIATION, &what, &mut notes);
        }
        TotalField::Rank => {
            record.combined_totals.slot_mut(slot).rank = admit_rank(value, &what, &mut notes);
        }
        TotalField::GradeLevel => {
            record.combined_totals.slot_mut(slot).grade_level =
                admit_grade(value, &what, &mut notes);
        }
    }

    record.annotations.extend(notes);
}

fn sweep_slot(slot: &mut TotalSlot, kind: SlotKind, annotations: &mut Vec<String>) {
    let label = kind.as_str();
    slot.raw_score = admit(
        slot.raw_score,
        score_range(kind),
        &format!("{label} score"),
        annotations,
    );
    slot.average = admit(
        slot.average,
        score_range(kind),
        &format!("{label} average"),
        annotations,
    );
    slot.average_delta = admit(
        slot.average_delta,
        average_delta_range(kind),
        &format!("{label} average delta"),
        annotations,
    );
    slot.percentile_deviation = admit(
        slot.percentile_deviation,
        PERCENTILE_DEVIATION,
        &format!("{label} deviation"),
        annotations,
    );
    slot.rank = slot
        .rank
        .and_then(|rank| admit_rank(Some(f64::from(rank)), &format!("{label} rank"), annotations));
    slot.grade_level = slot.grade_level.and_then(|grade| {
        admit_grade(
            Some(f64::from(grade)),
            &format!("{label} grade level"),
            annotations,
        )
    });
}

/// Nulls every numeric field that is outside the range table, annotating each drop.
pub fn sweep_record(record: &mut TestRecord) {
    let mut notes = Vec::new();

    sweep_slot(
        &mut record.combined_totals.two_subject,
        SlotKind::TwoSubject,
        &mut notes,
    );
    sweep_slot(
        &mut record.combined_totals.four_subject,
        SlotKind::FourSubject,
        &mut notes,
    );

    for entry in &mut record.subject_scores {
        let subject = entry.subject.as_str();
        entry.raw_score = admit(
            entry.raw_score,
            SUBJECT_SCORE,
            &format!("{subject} score"),
            &mut notes,
        );
        entry.average = admit(
            entry.average,
            SUBJECT_SCORE,
            &format!("{subject} average"),
            &mut notes,
        );
        entry.average_delta = admit(
            entry.average_delta,
            SUBJECT_AVERAGE_DELTA,
            &format!("{subject} average delta"),
            &mut notes,
        );
        entry.percentile_deviation = admit(
            entry.percentile_deviation,
            PERCENTILE_DEVIATION,
            &format!("{subject} deviation"),
            &mut notes,
        );
        entry.rank = entry
            .rank
            .and_then(|rank| admit_rank(Some(f64::from(rank)), &format!("{subject} rank"), &mut notes));
    }

    record.annotations.extend(notes);
}
