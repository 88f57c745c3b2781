use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestCategory {
    PeriodicGrowth,
    OpenMock,
    Other,
}

impl TestCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            TestCategory::PeriodicGrowth => "periodic-growth",
            TestCategory::OpenMock => "open-mock",
            TestCategory::Other => "other",
        }
    }

    /// Name used when a label has to be synthesized from a table section.
    pub fn display_name(self) -> &'static str {
        match self {
            TestCategory::PeriodicGrowth => "育成テスト",
            TestCategory::OpenMock => "公開模試",
            TestCategory::Other => "その他",
        }
    }

    pub fn sort_rank(self) -> u8 {
        match self {
            TestCategory::PeriodicGrowth => 0,
            TestCategory::OpenMock => 1,
            TestCategory::Other => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    Language,
    Math,
    Science,
    Social,
    Unknown,
}

impl Subject {
    pub fn as_str(self) -> &'static str {
        match self {
            Subject::Language => "language",
            Subject::Math => "math",
            Subject::Science => "science",
            Subject::Social => "social",
            Subject::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase();
        match normalized.as_str() {
            "国語" | "国" | "language" | "japanese" | "kokugo" => Subject::Language,
            "算数" | "算" | "数学" | "math" | "mathematics" | "arithmetic" => Subject::Math,
            "理科" | "理" | "science" => Subject::Science,
            "社会" | "社" | "social" | "social studies" => Subject::Social,
            _ => Subject::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotKind {
    TwoSubject,
    FourSubject,
}

impl SlotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotKind::TwoSubject => "2-subject",
            SlotKind::FourSubject => "4-subject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalField {
    RawScore,
    PercentileDeviation,
    Rank,
    AverageDelta,
    GradeLevel,
}

impl TotalField {
    pub fn as_str(self) -> &'static str {
        match self {
            TotalField::RawScore => "score",
            TotalField::PercentileDeviation => "deviation",
            TotalField::Rank => "rank",
            TotalField::AverageDelta => "average delta",
            TotalField::GradeLevel => "grade level",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectScore {
    pub subject: Subject,
    pub raw_score: Option<f64>,
    pub percentile_deviation: Option<f64>,
    pub rank: Option<u32>,
    pub average: Option<f64>,
    pub average_delta: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalSlot {
    pub raw_score: Option<f64>,
    pub percentile_deviation: Option<f64>,
    pub rank: Option<u32>,
    pub average: Option<f64>,
    pub average_delta: Option<f64>,
    pub grade_level: Option<u8>,
}

impl TotalSlot {
    pub fn is_empty(&self) -> bool {
        let finite = |value: Option<f64>| value.is_some_and(f64::is_finite);
        !finite(self.raw_score)
            && !finite(self.percentile_deviation)
            && self.rank.is_none()
            && !finite(self.average)
            && !finite(self.average_delta)
            && self.grade_level.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedTotals {
    pub two_subject: TotalSlot,
    pub four_subject: TotalSlot,
}

impl CombinedTotals {
    pub fn slot_mut(&mut self, kind: SlotKind) -> &mut TotalSlot {
        match kind {
            SlotKind::TwoSubject => &mut self.two_subject,
            SlotKind::FourSubject => &mut self.four_subject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatePrecision {
    Day,
    Month,
    Year,
}

impl DatePrecision {
    pub fn as_str(self) -> &'static str {
        match self {
            DatePrecision::Day => "day",
            DatePrecision::Month => "month",
            DatePrecision::Year => "year",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub category: TestCategory,
    pub label: Option<String>,
    /// Test type declared by the extraction service, kept apart from the free-form label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
    pub round: Option<u32>,
    pub occurred_on: Option<NaiveDate>,
    pub date_precision: Option<DatePrecision>,
    pub subject_scores: Vec<SubjectScore>,
    pub combined_totals: CombinedTotals,
    pub annotations: Vec<String>,
}

impl TestRecord {
    pub fn new(category: TestCategory, label: Option<String>) -> Self {
        Self {
            category,
            label,
            declared_type: None,
            round: None,
            occurred_on: None,
            date_precision: None,
            subject_scores: Vec::new(),
            combined_totals: CombinedTotals::default(),
            annotations: Vec::new(),
        }
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    pub fn has_deviation(&self) -> bool {
        let totals = &self.combined_totals;
        totals.two_subject.percentile_deviation.is_some()
            || totals.four_subject.percentile_deviation.is_some()
            || self
                .subject_scores
                .iter()
                .any(|entry| entry.percentile_deviation.is_some())
    }

    pub fn has_grade_level(&self) -> bool {
        self.combined_totals.two_subject.grade_level.is_some()
            || self.combined_totals.four_subject.grade_level.is_some()
    }

    pub fn has_average_delta(&self) -> bool {
        let totals = &self.combined_totals;
        totals.two_subject.average_delta.is_some()
            || totals.four_subject.average_delta.is_some()
            || self
                .subject_scores
                .iter()
                .any(|entry| entry.average_delta.is_some())
    }
}
