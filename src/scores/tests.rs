use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;

use super::*;
use crate::scores::classify::LabelClassifier;
use crate::scores::disambiguate::{
    CandidateYield, SelectionBasis, choose_variant, parse_transcript,
};
use crate::scores::layout::LayoutCatalog;
use crate::scores::pipeline::{ExtractionPath, MAX_CONCURRENT_REGIONS};
use crate::scores::ranges::{
    FOUR_SUBJECT_SCORE, GRADE_LEVEL_MAX, GRADE_LEVEL_MIN, PERCENTILE_DEVIATION, RANK,
    TWO_SUBJECT_SCORE,
};
use crate::scores::reconcile::{grade_level_for_delta, reconcile, sort_canonical};
use crate::scores::schema::{SchemaViolation, records_from_payload};
use crate::scores::trend::{TrendMetric, TrendVerdict, summarize_category, verdict_for};
use crate::scores::types::{DatePrecision, SlotKind, TestCategory, TestRecord, TotalSlot};
use crate::services::{
    DocumentHandle, DocumentStore, RegionHint, SchemaExtractor, ServiceError, Transcriber,
};

const ROUND_FIRST_TRANSCRIPT: &str = "成績推移
育成テスト
実施回 実施日 4科 評価 2科 評価
第10回 2024/04/14 300 6 190 6
第11回 2024/05/12 320 6 200 6
第12回 2024/06/09 350 7 220 7
公開模試
第1回 2024/07/07 310 55.2 190 54.0
第2回 2024/09/01 330 56.0 205 56.5
備考
よく頑張りました
";

const DATE_FIRST_TRANSCRIPT: &str = "育成テスト
実施日 回 4科 平均との差 評価 2科 平均との差 評価
2024年4月 第5回 300 +2 7 180 -2 -
2024年5月 第6回 320 +5 8 190 +1 6
公開模試
2024年7月 第1回 310 56 120 190 54 98
";

fn classifier() -> LabelClassifier {
    LabelClassifier::new().expect("classifier regexes compile")
}

fn catalog() -> LayoutCatalog {
    LayoutCatalog::new().expect("layout regexes compile")
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

fn growth(label: &str) -> TestRecord {
    TestRecord::new(TestCategory::PeriodicGrowth, Some(label.to_string()))
}

fn mock(label: &str) -> TestRecord {
    TestRecord::new(TestCategory::OpenMock, Some(label.to_string()))
}

fn assert_in_range(record: &TestRecord) {
    let totals = &record.combined_totals;
    for (kind, slot, score_range) in [
        (SlotKind::TwoSubject, &totals.two_subject, TWO_SUBJECT_SCORE),
        (SlotKind::FourSubject, &totals.four_subject, FOUR_SUBJECT_SCORE),
    ] {
        if let Some(score) = slot.raw_score {
            assert!(score_range.contains(score), "{} score {score}", kind.as_str());
        }
        if let Some(deviation) = slot.percentile_deviation {
            assert!(PERCENTILE_DEVIATION.contains(deviation));
        }
        if let Some(rank) = slot.rank {
            assert!(RANK.contains(f64::from(rank)));
        }
        if let Some(grade) = slot.grade_level {
            assert!((GRADE_LEVEL_MIN..=GRADE_LEVEL_MAX).contains(&grade));
        }
    }
}

#[test]
fn round_first_transcript_parses_both_sections() {
    let parsed = parse_transcript(
        ROUND_FIRST_TRANSCRIPT,
        LayoutHint::Auto,
        &catalog(),
        &classifier(),
    );

    assert_eq!(parsed.selection.chosen, LayoutVariant::RoundFirst);
    assert_eq!(parsed.selection.basis, SelectionBasis::Yield);
    assert_eq!(parsed.parsed.records.len(), 5);
    assert_eq!(parsed.parsed.sections_found, 2);

    let first = &parsed.parsed.records[0];
    assert_eq!(first.category, TestCategory::PeriodicGrowth);
    assert_eq!(first.label.as_deref(), Some("第10回 育成テスト"));
    assert_eq!(first.round, Some(10));
    assert_eq!(first.occurred_on, Some(ymd(2024, 4, 14)));
    assert_eq!(first.date_precision, Some(DatePrecision::Day));
    assert_eq!(first.combined_totals.four_subject.raw_score, Some(300.0));
    assert_eq!(first.combined_totals.four_subject.grade_level, Some(6));
    assert_eq!(first.combined_totals.two_subject.raw_score, Some(190.0));

    let mock_row = &parsed.parsed.records[3];
    assert_eq!(mock_row.category, TestCategory::OpenMock);
    assert_eq!(mock_row.label.as_deref(), Some("第1回 公開模試"));
    assert_eq!(mock_row.combined_totals.four_subject.percentile_deviation, Some(55.2));
    assert_eq!(mock_row.combined_totals.two_subject.percentile_deviation, Some(54.0));
}

#[test]
fn date_first_transcript_parses_deltas_and_ranks() {
    let parsed = parse_transcript(
        DATE_FIRST_TRANSCRIPT,
        LayoutHint::Auto,
        &catalog(),
        &classifier(),
    );

    assert_eq!(parsed.selection.chosen, LayoutVariant::DateFirst);
    assert_eq!(parsed.selection.basis, SelectionBasis::Yield);
    let yields = parsed
        .selection
        .candidates
        .iter()
        .map(|candidate| (candidate.variant, candidate.rows))
        .collect::<Vec<_>>();
    assert!(yields.contains(&(LayoutVariant::RoundFirst, 0)));
    assert!(yields.contains(&(LayoutVariant::DateFirst, 3)));

    let first = &parsed.parsed.records[0];
    assert_eq!(first.occurred_on, Some(ymd(2024, 4, 1)));
    assert_eq!(first.date_precision, Some(DatePrecision::Month));
    assert_eq!(first.combined_totals.four_subject.average_delta, Some(2.0));
    assert_eq!(first.combined_totals.two_subject.average_delta, Some(-2.0));
    assert_eq!(first.combined_totals.two_subject.grade_level, None);

    let mock_row = &parsed.parsed.records[2];
    assert_eq!(mock_row.combined_totals.four_subject.rank, Some(120));
    assert_eq!(mock_row.combined_totals.two_subject.rank, Some(98));
}

#[test]
fn declared_layout_runs_only_that_variant() {
    let parsed = parse_transcript(
        ROUND_FIRST_TRANSCRIPT,
        LayoutHint::Declared(LayoutVariant::DateFirst),
        &catalog(),
        &classifier(),
    );

    assert_eq!(parsed.selection.chosen, LayoutVariant::DateFirst);
    assert_eq!(parsed.selection.basis, SelectionBasis::Declared);
    assert_eq!(parsed.selection.candidates.len(), 1);
    assert!(parsed.parsed.records.is_empty());
}

#[test]
fn rows_with_unreadable_dates_are_skipped_and_counted() {
    let text = "育成テスト\n第1回 ??/?? 300 6 190 6\n第2回 2024/05/12 320 6 200 6\n";
    let parsed = parse_transcript(
        text,
        LayoutHint::Declared(LayoutVariant::RoundFirst),
        &catalog(),
        &classifier(),
    );

    assert_eq!(parsed.parsed.records.len(), 1);
    assert_eq!(parsed.parsed.skipped_rows, 1);
}

#[test]
fn tied_yields_fall_back_to_header_phrases_then_primary() {
    let header_only = parse_transcript(
        "育成テスト\n平均との差\n",
        LayoutHint::Auto,
        &catalog(),
        &classifier(),
    );
    assert_eq!(header_only.selection.chosen, LayoutVariant::DateFirst);
    assert_eq!(header_only.selection.basis, SelectionBasis::HeaderHeuristic);

    let nothing = parse_transcript("no table here", LayoutHint::Auto, &catalog(), &classifier());
    assert_eq!(nothing.selection.chosen, LayoutVariant::PRIMARY);
    assert_eq!(nothing.selection.basis, SelectionBasis::Default);
}

#[test]
fn equal_header_hits_on_tied_yields_pick_primary() {
    let candidates = vec![
        CandidateYield {
            variant: LayoutVariant::RoundFirst,
            rows: 2,
            skipped_rows: 0,
            header_hits: 1,
        },
        CandidateYield {
            variant: LayoutVariant::DateFirst,
            rows: 2,
            skipped_rows: 0,
            header_hits: 1,
        },
    ];
    assert_eq!(
        choose_variant(&candidates),
        (LayoutVariant::PRIMARY, SelectionBasis::Default)
    );
}

#[test]
fn classification_of_a_classified_record_is_a_fixed_point() {
    let classifier = classifier();

    let mut unlabeled = TestRecord::new(TestCategory::Other, None);
    unlabeled.combined_totals.four_subject.raw_score = Some(310.0);
    unlabeled.combined_totals.four_subject.percentile_deviation = Some(55.0);
    let category = classifier.classify(&unlabeled);
    assert_eq!(category, TestCategory::OpenMock);
    unlabeled.category = category;
    assert_eq!(classifier.classify(&unlabeled), category);
    assert_eq!(classifier.reclassify(&unlabeled), category);

    let mut labeled = growth("第3回 育成テスト");
    labeled.combined_totals.two_subject.grade_level = Some(7);
    labeled.combined_totals.two_subject.average_delta = Some(3.0);
    assert_eq!(classifier.classify(&labeled), TestCategory::PeriodicGrowth);
    assert_eq!(classifier.reclassify(&labeled), TestCategory::PeriodicGrowth);
}

#[test]
fn diagnostic_labels_are_excluded_whatever_the_structure() {
    let classifier = classifier();
    let mut record = mock("クラス分けテスト");
    record.combined_totals.four_subject.percentile_deviation = Some(58.0);
    assert_eq!(classifier.classify(&record), TestCategory::Other);

    let reconciled = reconcile(vec![record], &classifier);
    assert!(reconciled.records.is_empty());
    assert_eq!(reconciled.stats.dropped_other, 1);
}

#[test]
fn diagnostic_rows_inside_a_catalog_section_are_dropped() {
    let text = "公開模試\n第3回 実力判定テスト 2024/05/12 300 55 180 52\n第4回 2024/06/09 320 57 190 55\n";
    let parsed = parse_transcript(
        text,
        LayoutHint::Declared(LayoutVariant::RoundFirst),
        &catalog(),
        &classifier(),
    );
    assert_eq!(parsed.parsed.records.len(), 2);
    assert_eq!(parsed.parsed.records[0].category, TestCategory::Other);

    let reconciled = reconcile(parsed.parsed.records, &classifier());
    assert_eq!(reconciled.records.len(), 1);
    assert_eq!(reconciled.records[0].label.as_deref(), Some("第4回 公開模試"));
}

#[test]
fn misplaced_four_subject_total_is_swapped_back() {
    let mut record = growth("第4回 育成テスト");
    record.combined_totals.two_subject.raw_score = Some(450.0);
    record.combined_totals.two_subject.grade_level = Some(8);

    let reconciled = reconcile(vec![record], &classifier());
    let repaired = &reconciled.records[0];
    assert_eq!(repaired.combined_totals.four_subject.raw_score, Some(450.0));
    assert_eq!(repaired.combined_totals.two_subject.raw_score, None);
    assert_eq!(repaired.combined_totals.four_subject.grade_level, Some(8));
    assert_eq!(reconciled.stats.column_swaps, 1);
    assert!(repaired.annotations.iter().any(|note| note.starts_with("swapped")));
}

#[test]
fn parser_holds_misplaced_total_for_the_swap() {
    let text = "育成テスト\n第4回 2024/06/09 - - 450 8\n";
    let parsed = parse_transcript(
        text,
        LayoutHint::Declared(LayoutVariant::RoundFirst),
        &catalog(),
        &classifier(),
    );
    assert_eq!(
        parsed.parsed.records[0].combined_totals.two_subject.raw_score,
        Some(450.0)
    );

    let reconciled = reconcile(parsed.parsed.records, &classifier());
    let totals = &reconciled.records[0].combined_totals;
    assert_eq!(totals.four_subject.raw_score, Some(450.0));
    assert_eq!(totals.two_subject.raw_score, None);
}

#[test]
fn inverted_totals_are_swapped() {
    let mut record = growth("第5回 育成テスト");
    record.combined_totals.four_subject.raw_score = Some(150.0);
    record.combined_totals.two_subject.raw_score = Some(300.0);

    let reconciled = reconcile(vec![record], &classifier());
    let totals = &reconciled.records[0].combined_totals;
    assert_eq!(totals.four_subject.raw_score, Some(300.0));
    assert_eq!(totals.two_subject.raw_score, Some(150.0));
}

#[test]
fn held_total_without_a_swap_is_nulled_by_the_sweep() {
    let mut record = growth("第6回 育成テスト");
    record.combined_totals.two_subject.raw_score = Some(450.0);
    record.combined_totals.four_subject.raw_score = Some(480.0);

    let reconciled = reconcile(vec![record], &classifier());
    let totals = &reconciled.records[0].combined_totals;
    assert_eq!(totals.two_subject.raw_score, None);
    assert_eq!(totals.four_subject.raw_score, Some(480.0));
}

#[test]
fn date_fragment_read_as_mock_score_is_suppressed() {
    let mut record = mock("第2回 公開模試");
    record.combined_totals.four_subject.raw_score = Some(15.0);
    record.combined_totals.four_subject.percentile_deviation = Some(55.0);

    let reconciled = reconcile(vec![record], &classifier());
    let slot = &reconciled.records[0].combined_totals.four_subject;
    assert_eq!(slot.raw_score, None);
    assert_eq!(slot.percentile_deviation, None);
    assert_eq!(reconciled.stats.suspicious_scores_suppressed, 1);
}

#[test]
fn grade_levels_follow_the_average_delta_scale() {
    assert_eq!(grade_level_for_delta(5.0), 8);
    assert_eq!(grade_level_for_delta(-2.0), 4);
    assert_eq!(grade_level_for_delta(8.0), 10);
    assert_eq!(grade_level_for_delta(0.0), 5);
    assert_eq!(grade_level_for_delta(-10.0), 3);

    let mut record = growth("第7回 育成テスト");
    record.combined_totals.two_subject.average_delta = Some(5.0);
    record.combined_totals.four_subject.average_delta = Some(-2.0);
    let reconciled = reconcile(vec![record], &classifier());
    let totals = &reconciled.records[0].combined_totals;
    assert_eq!(totals.two_subject.grade_level, Some(8));
    assert_eq!(totals.four_subject.grade_level, Some(4));
    assert_eq!(reconciled.stats.grade_levels_derived, 2);
}

#[test]
fn open_mock_records_never_get_derived_grades() {
    let mut record = mock("第3回 公開模試");
    record.combined_totals.two_subject.average_delta = Some(5.0);
    let reconciled = reconcile(vec![record], &classifier());
    assert_eq!(reconciled.records[0].combined_totals.two_subject.grade_level, None);
}

#[test]
fn grades_and_deviations_never_share_a_record() {
    let mut growth_record = growth("第8回 育成テスト");
    growth_record.combined_totals.four_subject.grade_level = Some(7);
    growth_record.combined_totals.four_subject.percentile_deviation = Some(60.0);
    let mut mock_record = mock("第4回 公開模試");
    mock_record.combined_totals.two_subject.grade_level = Some(6);
    mock_record.combined_totals.two_subject.percentile_deviation = Some(52.0);

    let reconciled = reconcile(vec![growth_record, mock_record], &classifier());
    assert_eq!(reconciled.records.len(), 2);
    for record in &reconciled.records {
        assert!(!(record.has_grade_level() && record.has_deviation()));
    }
    assert_eq!(reconciled.stats.exclusive_fields_nulled, 2);
}

#[test]
fn reconciled_values_are_in_range() {
    let mut growth_record = growth("第9回 育成テスト");
    growth_record.combined_totals.four_subject.raw_score = Some(620.0);
    growth_record.combined_totals.four_subject.average_delta = Some(900.0);
    growth_record.combined_totals.two_subject.grade_level = Some(12);
    let mut mock_record = mock("第5回 公開模試");
    mock_record.combined_totals.four_subject.percentile_deviation = Some(95.0);
    mock_record.combined_totals.two_subject.rank = Some(0);
    mock_record.combined_totals.two_subject.raw_score = Some(f64::NAN);

    let reconciled = reconcile(vec![growth_record, mock_record], &classifier());
    for record in &reconciled.records {
        assert_in_range(record);
    }
    assert!(
        reconciled.records[0]
            .annotations
            .iter()
            .any(|note| note.contains("620"))
    );
}

#[test]
fn exact_duplicates_collapse_to_one() {
    let mut record = growth("第10回 育成テスト");
    record.occurred_on = Some(ymd(2024, 4, 14));
    record.combined_totals.two_subject.raw_score = Some(190.0);
    record.combined_totals.two_subject.grade_level = Some(6);

    let mut near = record.clone();
    near.combined_totals.two_subject.raw_score = Some(191.0);

    let reconciled = reconcile(vec![record.clone(), record, near], &classifier());
    assert_eq!(reconciled.records.len(), 2);
    assert_eq!(reconciled.stats.duplicates_removed, 1);
}

#[test]
fn canonical_order_puts_growth_before_mock_then_label() {
    let mut records = vec![
        mock("第1回 公開模試"),
        growth("第2回 育成テスト"),
        growth("第1回 育成テスト"),
    ];
    sort_canonical(&mut records);
    let labels = records
        .iter()
        .map(|record| record.label.as_deref().unwrap_or_default())
        .collect::<Vec<&str>>();
    assert_eq!(labels, vec!["第1回 育成テスト", "第2回 育成テスト", "第1回 公開模試"]);
}

#[test]
fn trend_verdicts_compare_first_and_last_only() {
    assert_eq!(verdict_for(&[6.0, 6.0, 7.0], 1.0), TrendVerdict::Rising);
    assert_eq!(verdict_for(&[54.0, 55.0, 56.0], 3.0), TrendVerdict::Flat);
    assert_eq!(verdict_for(&[58.0, 40.0, 54.0], 3.0), TrendVerdict::Falling);
    assert_eq!(verdict_for(&[55.0], 3.0), TrendVerdict::Indeterminate);
    assert_eq!(verdict_for(&[], 3.0), TrendVerdict::Indeterminate);
}

#[test]
fn growth_trend_uses_raw_scores_only_when_no_grades_exist() {
    let mut early = growth("第1回 育成テスト");
    early.occurred_on = Some(ymd(2024, 4, 1));
    early.combined_totals.two_subject.raw_score = Some(200.0);
    let mut late = growth("第2回 育成テスト");
    late.occurred_on = Some(ymd(2024, 5, 1));
    late.combined_totals.two_subject.raw_score = Some(215.0);

    let summary = summarize_category(&[late.clone(), early.clone()], TestCategory::PeriodicGrowth);
    assert_eq!(summary.metric, TrendMetric::TwoSubjectScore);
    assert_eq!(summary.values, vec![200.0, 215.0]);
    assert_eq!(summary.verdict, TrendVerdict::Rising);

    late.combined_totals.two_subject.grade_level = Some(7);
    let summary = summarize_category(&[early, late], TestCategory::PeriodicGrowth);
    assert_eq!(summary.metric, TrendMetric::GradeLevel);
    assert_eq!(summary.values, vec![7.0]);
    assert_eq!(summary.verdict, TrendVerdict::Indeterminate);
}

#[test]
fn undated_records_trail_the_trend_series() {
    let mut undated = mock("補講 公開模試");
    undated.combined_totals.four_subject.percentile_deviation = Some(40.0);
    let mut dated = mock("第1回 公開模試");
    dated.occurred_on = Some(ymd(2024, 7, 7));
    dated.combined_totals.four_subject.percentile_deviation = Some(50.0);

    let summary = summarize_category(&[undated, dated], TestCategory::OpenMock);
    assert_eq!(summary.values, vec![50.0, 40.0]);
    assert_eq!(summary.verdict, TrendVerdict::Falling);
}

#[test]
fn schema_payload_is_coerced_into_records() {
    let raw = r#"```json
{"tests": [
  {"test_type": "育成テスト", "test_name": "第3回 育成テスト", "date": "2024-05-12",
   "two_subject": {"score": "210", "average_diff": 5, "grade": 2},
   "four_subject": {"score": 340, "grade": 7},
   "subjects": [{"subject": "算数", "score": "95点"}]},
  {"test_type": "mock exam", "date": "2024年7月", "four_subject": {"score": 310, "deviation": 55.5}},
  "not an object"
]}
```"#;

    let coerced = records_from_payload(raw, &classifier()).expect("valid payload");
    assert_eq!(coerced.skipped_entries, 1);
    let records = coerced.records;
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.category, TestCategory::PeriodicGrowth);
    assert_eq!(first.occurred_on, Some(ymd(2024, 5, 12)));
    assert_eq!(first.combined_totals.two_subject.raw_score, Some(210.0));
    assert_eq!(first.combined_totals.two_subject.grade_level, None);
    assert!(first.annotations.iter().any(|note| note.contains("likely misread")));
    assert_eq!(first.subject_scores[0].raw_score, Some(95.0));

    let second = &records[1];
    assert_eq!(second.category, TestCategory::OpenMock);
    assert_eq!(second.date_precision, Some(DatePrecision::Month));
}

#[test]
fn schema_violations_are_reported() {
    let classifier = classifier();
    assert!(matches!(
        records_from_payload("I could not read the page", &classifier),
        Err(SchemaViolation::InvalidJson(_))
    ));
    assert!(matches!(
        records_from_payload(r#"{"results": []}"#, &classifier),
        Err(SchemaViolation::MissingTests)
    ));
}

#[test]
fn declared_diagnostic_type_stays_excluded_after_reconciliation() {
    let classifier = classifier();
    let raw = r#"{"tests": [{"test_type": "診断テスト", "test_name": "第3回",
        "four_subject": {"score": 310, "deviation": 55.0}}]}"#;

    let coerced = records_from_payload(raw, &classifier).expect("valid payload");
    assert_eq!(coerced.records[0].category, TestCategory::Other);
    assert_eq!(coerced.records[0].declared_type.as_deref(), Some("診断テスト"));

    let reconciled = reconcile(coerced.records, &classifier);
    assert!(reconciled.records.is_empty());
    assert_eq!(reconciled.stats.dropped_other, 1);
    assert_eq!(reconciled.stats.reclassified, 0);
}

#[test]
fn declared_type_outranks_a_conflicting_name_through_reconciliation() {
    let classifier = classifier();
    let raw = r#"{"tests": [{"test_type": "公開模試", "test_name": "第3回 育成テスト",
        "date": "2024-07-07", "four_subject": {"score": 310, "deviation": 55}}]}"#;

    let coerced = records_from_payload(raw, &classifier).expect("valid payload");
    assert_eq!(coerced.records[0].category, TestCategory::OpenMock);

    let reconciled = reconcile(coerced.records, &classifier);
    let record = &reconciled.records[0];
    assert_eq!(record.category, TestCategory::OpenMock);
    assert_eq!(record.combined_totals.four_subject.percentile_deviation, Some(55.0));
    assert_eq!(reconciled.stats.reclassified, 0);
    assert!(!record.annotations.iter().any(|note| note.contains("reclassified")));
}

#[test]
fn mistyped_fields_degrade_to_null_without_dropping_the_test() {
    let raw = r#"{"tests": [{"test_type": "育成テスト", "test_name": 3, "date": 20240512,
        "subjects": "none",
        "four_subject": {"score": 310, "grade": true},
        "two_subject": [190]}]}"#;

    let coerced = records_from_payload(raw, &classifier()).expect("valid payload");
    assert_eq!(coerced.skipped_entries, 0);
    let record = &coerced.records[0];
    assert_eq!(record.category, TestCategory::PeriodicGrowth);
    assert_eq!(record.label.as_deref(), Some("育成テスト"));
    assert_eq!(record.occurred_on, None);
    assert_eq!(record.combined_totals.four_subject.raw_score, Some(310.0));
    assert_eq!(record.combined_totals.four_subject.grade_level, None);
    assert_eq!(record.combined_totals.two_subject, TotalSlot::default());
    assert!(record.subject_scores.is_empty());

    for field in ["test_name", "date", "subjects", "4-subject grade", "2-subject total"] {
        assert!(
            record
                .annotations
                .iter()
                .any(|note| note.starts_with(field) && note.contains("unexpected JSON type")),
            "missing note for {field}: {:?}",
            record.annotations
        );
    }
}

#[test]
fn totals_without_finite_values_are_reset_and_counted() {
    let mut record = growth("第1回 育成テスト");
    record.occurred_on = Some(ymd(2024, 4, 14));
    record.combined_totals.four_subject.raw_score = Some(300.0);
    record.combined_totals.four_subject.grade_level = Some(6);
    record.combined_totals.two_subject.raw_score = Some(f64::NAN);
    record.combined_totals.two_subject.average = Some(f64::INFINITY);

    let reconciled = reconcile(vec![record], &classifier());
    assert_eq!(reconciled.stats.empty_totals_reset, 1);

    let record = &reconciled.records[0];
    assert_eq!(record.combined_totals.two_subject, TotalSlot::default());
    assert_eq!(record.combined_totals.four_subject.raw_score, Some(300.0));
    assert!(
        record
            .annotations
            .iter()
            .any(|note| note == "reset 2-subject total with no usable values")
    );
}

struct FakeStore {
    handle: DocumentHandle,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            handle: DocumentHandle::new("a".repeat(64)),
        }
    }
}

impl DocumentStore for FakeStore {
    fn put(&self, _bytes: &[u8], _name: &str) -> Result<DocumentHandle, ServiceError> {
        Ok(self.handle.clone())
    }

    fn get(&self, handle: &DocumentHandle) -> Result<Vec<u8>, ServiceError> {
        if *handle == self.handle {
            Ok(b"%PDF-1.7".to_vec())
        } else {
            Err(ServiceError::Storage(format!("unknown document {handle}")))
        }
    }
}

/// Answers per region hint; `None` as the key is the whole-document answer.
struct FakeTranscriber {
    answers: Vec<(Option<&'static str>, Result<&'static str, &'static str>)>,
}

impl Transcriber for FakeTranscriber {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn transcribe(
        &self,
        _document: &[u8],
        region: Option<&RegionHint>,
    ) -> Result<String, ServiceError> {
        let key = region.map(RegionHint::as_str);
        match self.answers.iter().find(|(region, _)| *region == key) {
            Some((_, Ok(text))) => Ok(text.to_string()),
            Some((_, Err(reason))) => Err(ServiceError::Unavailable(reason.to_string())),
            None => Ok(String::new()),
        }
    }
}

struct FakeExtractor {
    answer: Result<&'static str, &'static str>,
}

impl SchemaExtractor for FakeExtractor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn extract(&self, _document: &[u8], schema: &serde_json::Value) -> Result<String, ServiceError> {
        assert!(schema.get("properties").is_some());
        self.answer
            .map(str::to_string)
            .map_err(|reason| ServiceError::Unavailable(reason.to_string()))
    }
}

fn request(store: &FakeStore, regions: &[&str]) -> DocumentRequest {
    DocumentRequest {
        handle: store.handle.clone(),
        layout: LayoutHint::Auto,
        region_hints: regions.iter().map(|region| RegionHint::new(*region)).collect(),
    }
}

fn report_pipeline() -> ReportPipeline {
    ReportPipeline::new().expect("pipeline")
}

#[test]
fn transcription_path_produces_a_canonical_report() {
    let store = FakeStore::new();
    let transcriber = FakeTranscriber {
        answers: vec![(None, Ok(ROUND_FIRST_TRANSCRIPT))],
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: None,
    };

    let report = report_pipeline()
        .process(services, &request(&store, &[]))
        .expect("report");

    assert!(report.ok);
    assert_eq!(report.error, None);
    assert_eq!(report.extraction_path, ExtractionPath::Transcription);
    assert_eq!(report.records.len(), 5);
    assert_eq!(report.diagnostics.reconcile.records_out, 5);
    let layout = report.diagnostics.layout.as_ref().expect("layout selection");
    assert_eq!(layout.chosen, LayoutVariant::RoundFirst);

    let growth_trend = report
        .trends
        .iter()
        .find(|trend| trend.category == TestCategory::PeriodicGrowth)
        .expect("growth trend");
    assert_eq!(growth_trend.values, vec![6.0, 6.0, 7.0]);
    assert_eq!(growth_trend.verdict, TrendVerdict::Rising);

    let mock_trend = report
        .trends
        .iter()
        .find(|trend| trend.category == TestCategory::OpenMock)
        .expect("mock trend");
    assert_eq!(mock_trend.verdict, TrendVerdict::Flat);
}

#[test]
fn region_transcriptions_are_joined_and_failures_only_warn() {
    let store = FakeStore::new();
    let transcriber = FakeTranscriber {
        answers: vec![
            (Some("page 1"), Ok("育成テスト\n第1回 2024/04/14 300 6 190 6\n")),
            (Some("page 2"), Ok("公開模試\n第1回 2024/07/07 310 55 190 54\n")),
            (Some("page 3"), Err("model offline")),
        ],
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: None,
    };

    let report = report_pipeline()
        .process(services, &request(&store, &["page 1", "page 2", "page 3"]))
        .expect("report");

    assert!(report.ok);
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.diagnostics.regions_transcribed, 2);
    assert_eq!(report.diagnostics.warnings.len(), 1);
}

/// Tracks how many transcriptions overlap.
struct CountingTranscriber {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Transcriber for CountingTranscriber {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn transcribe(
        &self,
        _document: &[u8],
        _region: Option<&RegionHint>,
    ) -> Result<String, ServiceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok("育成テスト\n第1回 2024/04/14 300 6 190 6\n".to_string())
    }
}

#[test]
fn region_transcriptions_run_in_bounded_batches() {
    let store = FakeStore::new();
    let transcriber = CountingTranscriber {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: None,
    };
    let regions = ["page 1", "page 2", "page 3", "page 4", "page 5", "page 6"];

    let report = report_pipeline()
        .process(services, &request(&store, &regions))
        .expect("report");

    assert_eq!(report.diagnostics.regions_transcribed, regions.len());
    let peak = transcriber.peak.load(Ordering::SeqCst);
    assert!((1..=MAX_CONCURRENT_REGIONS).contains(&peak), "peak {peak}");
}

#[test]
fn failed_transcription_falls_back_to_schema_extraction() {
    let store = FakeStore::new();
    let transcriber = FakeTranscriber {
        answers: vec![(None, Err("tesseract missing"))],
    };
    let extractor = FakeExtractor {
        answer: Ok(r#"{"tests": [{"test_type": "育成テスト", "test_name": "第3回 育成テスト",
            "date": "2024-05-12", "two_subject": {"score": 210, "average_diff": 5}}]}"#),
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: Some(&extractor as &dyn SchemaExtractor),
    };

    let report = report_pipeline()
        .process(services, &request(&store, &[]))
        .expect("report");

    assert!(report.ok);
    assert_eq!(report.extraction_path, ExtractionPath::SchemaFallback);
    assert_eq!(
        report.records[0].combined_totals.two_subject.grade_level,
        Some(8)
    );
    assert!(!report.diagnostics.warnings.is_empty());
}

#[test]
fn rejected_extraction_keeps_the_raw_text() {
    let store = FakeStore::new();
    let transcriber = FakeTranscriber {
        answers: vec![(None, Ok("   \n"))],
    };
    let extractor = FakeExtractor {
        answer: Ok("sorry, no JSON today"),
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: Some(&extractor as &dyn SchemaExtractor),
    };

    let report = report_pipeline()
        .process(services, &request(&store, &[]))
        .expect("report");

    assert!(!report.ok);
    assert!(report.records.is_empty());
    assert_eq!(
        report.diagnostics.raw_extraction_text.as_deref(),
        Some("sorry, no JSON today")
    );
}

#[test]
fn both_paths_failing_yields_a_null_result_with_reason() {
    let store = FakeStore::new();
    let transcriber = FakeTranscriber {
        answers: vec![(None, Err("tesseract missing"))],
    };
    let extractor = FakeExtractor {
        answer: Err("ollama offline"),
    };
    let services = Services {
        store: &store,
        transcriber: Some(&transcriber as &dyn Transcriber),
        extractor: Some(&extractor as &dyn SchemaExtractor),
    };

    let report = report_pipeline()
        .process(services, &request(&store, &[]))
        .expect("report");

    assert!(!report.ok);
    assert_eq!(report.extraction_path, ExtractionPath::None);
    assert!(
        report
            .error
            .as_deref()
            .is_some_and(|reason| reason.contains("both failed"))
    );
}

#[test]
fn storage_failure_is_fatal() {
    let store = FakeStore::new();
    let services = Services {
        store: &store,
        transcriber: None,
        extractor: None,
    };
    let missing = DocumentRequest {
        handle: DocumentHandle::new("b".repeat(64)),
        layout: LayoutHint::Auto,
        region_hints: Vec::new(),
    };

    assert!(report_pipeline().process(services, &missing).is_err());
}

#[test]
fn empty_canonical_set_is_not_ok() {
    let report = report_pipeline().process_text(
        "公開模試\n第3回 実力判定テスト 2024/05/12 300 55 180 52\n",
        LayoutHint::Auto,
    );

    assert!(!report.ok);
    assert_eq!(report.error.as_deref(), Some(pipeline::EMPTY_RESULT_REASON));
    assert_eq!(report.diagnostics.reconcile.dropped_other, 1);
}

#[test]
fn markdown_summary_lists_tables_trends_and_notes() {
    let report = report_pipeline().process_text(DATE_FIRST_TRANSCRIPT, LayoutHint::Auto);
    let markdown = render_markdown(&report);

    assert!(markdown.starts_with("# Score Report"));
    assert!(markdown.contains("## 育成テスト"));
    assert!(markdown.contains("## 公開模試"));
    assert!(markdown.contains("Trend (grade level): rising from 4 to 6 over 2 tests"));
    assert!(markdown.contains("derived 2-subject grade level 4 from average delta -2"));
}
