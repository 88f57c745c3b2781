use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::types::{TestCategory, TestRecord};

pub const GRADE_LEVEL_THRESHOLD: f64 = 1.0;
pub const DEVIATION_THRESHOLD: f64 = 3.0;
pub const RAW_SCORE_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrendVerdict {
    Rising,
    Falling,
    Flat,
    Indeterminate,
}

impl TrendVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendVerdict::Rising => "rising",
            TrendVerdict::Falling => "falling",
            TrendVerdict::Flat => "flat",
            TrendVerdict::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrendMetric {
    GradeLevel,
    TwoSubjectScore,
    PercentileDeviation,
}

impl TrendMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendMetric::GradeLevel => "grade level",
            TrendMetric::TwoSubjectScore => "2-subject score",
            TrendMetric::PercentileDeviation => "deviation",
        }
    }

    pub fn threshold(self) -> f64 {
        match self {
            TrendMetric::GradeLevel => GRADE_LEVEL_THRESHOLD,
            TrendMetric::TwoSubjectScore => RAW_SCORE_THRESHOLD,
            TrendMetric::PercentileDeviation => DEVIATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub label: Option<String>,
    pub occurred_on: Option<NaiveDate>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub category: TestCategory,
    pub metric: TrendMetric,
    pub values: Vec<f64>,
    pub points: Vec<TrendPoint>,
    pub first: Option<f64>,
    pub last: Option<f64>,
    pub delta: Option<f64>,
    pub verdict: TrendVerdict,
}

/// First-vs-last comparison; intermediate values never move the verdict.
pub fn verdict_for(values: &[f64], threshold: f64) -> TrendVerdict {
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return TrendVerdict::Indeterminate;
    };
    if values.len() < 2 {
        return TrendVerdict::Indeterminate;
    }

    let difference = last - first;
    if difference >= threshold {
        TrendVerdict::Rising
    } else if difference <= -threshold {
        TrendVerdict::Falling
    } else {
        TrendVerdict::Flat
    }
}

fn grade_value(record: &TestRecord) -> Option<f64> {
    let totals = &record.combined_totals;
    totals
        .two_subject
        .grade_level
        .or(totals.four_subject.grade_level)
        .map(f64::from)
}

fn deviation_value(record: &TestRecord) -> Option<f64> {
    let totals = &record.combined_totals;
    totals
        .four_subject
        .percentile_deviation
        .or(totals.two_subject.percentile_deviation)
}

fn metric_value(record: &TestRecord, metric: TrendMetric) -> Option<f64> {
    match metric {
        TrendMetric::GradeLevel => grade_value(record),
        TrendMetric::TwoSubjectScore => record.combined_totals.two_subject.raw_score,
        TrendMetric::PercentileDeviation => deviation_value(record),
    }
}

/// Summarizes one category. Records are taken in chronological order with undated
/// records last; a series never mixes grade levels with raw scores.
pub fn summarize_category(records: &[TestRecord], category: TestCategory) -> TrendSummary {
    let mut series = records
        .iter()
        .filter(|record| record.category == category)
        .collect::<Vec<&TestRecord>>();
    series.sort_by_key(|record| (record.occurred_on.is_none(), record.occurred_on));

    let metric = match category {
        TestCategory::OpenMock => TrendMetric::PercentileDeviation,
        _ if series.iter().any(|record| grade_value(record).is_some()) => TrendMetric::GradeLevel,
        _ if series
            .iter()
            .any(|record| record.combined_totals.two_subject.raw_score.is_some()) =>
        {
            TrendMetric::TwoSubjectScore
        }
        _ => TrendMetric::GradeLevel,
    };

    let points = series
        .iter()
        .filter_map(|record| {
            metric_value(record, metric).map(|value| TrendPoint {
                label: record.label.clone(),
                occurred_on: record.occurred_on,
                value,
            })
        })
        .collect::<Vec<TrendPoint>>();
    let values = points.iter().map(|point| point.value).collect::<Vec<f64>>();

    let first = values.first().copied();
    let last = values.last().copied();
    let delta = match (first, last) {
        (Some(first), Some(last)) if values.len() >= 2 => Some(last - first),
        _ => None,
    };

    TrendSummary {
        category,
        metric,
        verdict: verdict_for(&values, metric.threshold()),
        values,
        points,
        first,
        last,
        delta,
    }
}

/// One summary per catalog category present in the record set.
pub fn summarize_trends(records: &[TestRecord]) -> Vec<TrendSummary> {
    [TestCategory::PeriodicGrowth, TestCategory::OpenMock]
        .into_iter()
        .filter(|category| records.iter().any(|record| record.category == *category))
        .map(|category| summarize_category(records, category))
        .collect()
}
