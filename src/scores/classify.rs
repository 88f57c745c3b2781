use anyhow::{Context, Result};
use regex::Regex;

use super::normalize::{normalize_whitespace, normalize_width};
use super::types::{TestCategory, TestRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelVerdict {
    Category(TestCategory),
    /// Diagnostic/placement tests are out of catalog and never leave the pipeline.
    ForcedOther,
    Unrecognized,
}

pub struct LabelClassifier {
    diagnostic: Regex,
    periodic_growth: Regex,
    open_mock: Regex,
}

impl LabelClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            diagnostic: Regex::new(
                r"診断|実力判定|クラス分け|クラス判定|入塾|placement|diagnostic",
            )
            .context("failed to compile diagnostic test regex")?,
            periodic_growth: Regex::new(r"育成テスト|育成|periodic[\s-]*growth|growth\s*test")
                .context("failed to compile periodic-growth label regex")?,
            open_mock: Regex::new(r"公開模試|公開模擬|模試|open[\s-]*mock|mock\s*exam")
                .context("failed to compile open-mock label regex")?,
        })
    }

    pub fn classify_label(&self, label: Option<&str>) -> LabelVerdict {
        let Some(label) = label else {
            return LabelVerdict::Unrecognized;
        };

        let normalized = normalize_whitespace(&normalize_width(label)).to_lowercase();
        if normalized.is_empty() {
            return LabelVerdict::Unrecognized;
        }

        if self.diagnostic.is_match(&normalized) {
            LabelVerdict::ForcedOther
        } else if self.periodic_growth.is_match(&normalized) {
            LabelVerdict::Category(TestCategory::PeriodicGrowth)
        } else if self.open_mock.is_match(&normalized) {
            LabelVerdict::Category(TestCategory::OpenMock)
        } else {
            LabelVerdict::Unrecognized
        }
    }

    /// A diagnostic verdict from either the declared type or the label wins; otherwise
    /// the declared type outranks the free-form label.
    pub fn record_verdict(&self, record: &TestRecord) -> LabelVerdict {
        let declared = self.classify_label(record.declared_type.as_deref());
        let named = self.classify_label(record.label.as_deref());
        match (declared, named) {
            (LabelVerdict::ForcedOther, _) | (_, LabelVerdict::ForcedOther) => {
                LabelVerdict::ForcedOther
            }
            (LabelVerdict::Category(category), _) | (_, LabelVerdict::Category(category)) => {
                LabelVerdict::Category(category)
            }
            (LabelVerdict::Unrecognized, LabelVerdict::Unrecognized) => LabelVerdict::Unrecognized,
        }
    }

    /// Labels first, structural signals when they say nothing.
    pub fn classify(&self, record: &TestRecord) -> TestCategory {
        match self.record_verdict(record) {
            LabelVerdict::Category(category) => category,
            LabelVerdict::ForcedOther => TestCategory::Other,
            LabelVerdict::Unrecognized => infer_from_structure(record),
        }
    }

    /// Post-repair pass: a category label keeps its category, a diagnostic label stays
    /// excluded, and only unlabeled `other` records may be promoted on structural evidence.
    pub fn reclassify(&self, record: &TestRecord) -> TestCategory {
        match self.record_verdict(record) {
            LabelVerdict::Category(category) => category,
            LabelVerdict::ForcedOther => TestCategory::Other,
            LabelVerdict::Unrecognized if record.category == TestCategory::Other => {
                infer_from_structure(record)
            }
            LabelVerdict::Unrecognized => record.category,
        }
    }
}

pub fn infer_from_structure(record: &TestRecord) -> TestCategory {
    if record.has_deviation() {
        TestCategory::OpenMock
    } else if record.has_grade_level() || record.has_average_delta() {
        TestCategory::PeriodicGrowth
    } else {
        TestCategory::Other
    }
}
