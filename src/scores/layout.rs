use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::{SlotKind, TestCategory, TotalField};

/// Known shapes of the score-history table on transcribed grade reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutVariant {
    /// `第12回 2024/05/12 350 7 220 6`
    RoundFirst,
    /// `2024年5月 第12回 350 +12 7 220 -3 6`
    DateFirst,
}

impl LayoutVariant {
    pub const PRIMARY: LayoutVariant = LayoutVariant::RoundFirst;

    pub fn as_str(self) -> &'static str {
        match self {
            LayoutVariant::RoundFirst => "round-first",
            LayoutVariant::DateFirst => "date-first",
        }
    }
}

impl fmt::Display for LayoutVariant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOrder {
    RoundThenDate,
    DateThenRound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub slot: SlotKind,
    pub field: TotalField,
}

const fn column(slot: SlotKind, field: TotalField) -> Column {
    Column { slot, field }
}

struct SectionTemplate {
    category: TestCategory,
    start_markers: &'static [&'static str],
    end_markers: &'static [&'static str],
    columns: &'static [Column],
}

struct LayoutTemplate {
    variant: LayoutVariant,
    order: RowOrder,
    header_phrases: &'static [&'static str],
    sections: &'static [SectionTemplate],
}

const GROWTH_START: &[&str] = &[
    r"(?m)^[\s【\[■●]*育成テスト",
    r"(?im)^[\s\[#*]*periodic[\s-]*growth",
];
const MOCK_START: &[&str] = &[
    r"(?m)^[\s【\[■●]*公開模(?:試|擬試験)",
    r"(?im)^[\s\[#*]*open[\s-]*mock",
];
const GROWTH_END: &[&str] = &[
    r"(?m)^[\s【\[■●]*公開模(?:試|擬試験)",
    r"(?im)^[\s\[#*]*open[\s-]*mock",
    r"(?m)^[\s【\[■●]*(?:備考|所見|コメント)",
    r"(?im)^[\s\[#*]*(?:remarks|comments)",
];
const MOCK_END: &[&str] = &[
    r"(?m)^[\s【\[■●]*育成テスト",
    r"(?im)^[\s\[#*]*periodic[\s-]*growth",
    r"(?m)^[\s【\[■●]*(?:備考|所見|コメント)",
    r"(?im)^[\s\[#*]*(?:remarks|comments)",
];

const ROUND_FIRST_GROWTH: &[Column] = &[
    column(SlotKind::FourSubject, TotalField::RawScore),
    column(SlotKind::FourSubject, TotalField::GradeLevel),
    column(SlotKind::TwoSubject, TotalField::RawScore),
    column(SlotKind::TwoSubject, TotalField::GradeLevel),
];
const ROUND_FIRST_MOCK: &[Column] = &[
    column(SlotKind::FourSubject, TotalField::RawScore),
    column(SlotKind::FourSubject, TotalField::PercentileDeviation),
    column(SlotKind::TwoSubject, TotalField::RawScore),
    column(SlotKind::TwoSubject, TotalField::PercentileDeviation),
];
const DATE_FIRST_GROWTH: &[Column] = &[
    column(SlotKind::FourSubject, TotalField::RawScore),
    column(SlotKind::FourSubject, TotalField::AverageDelta),
    column(SlotKind::FourSubject, TotalField::GradeLevel),
    column(SlotKind::TwoSubject, TotalField::RawScore),
    column(SlotKind::TwoSubject, TotalField::AverageDelta),
    column(SlotKind::TwoSubject, TotalField::GradeLevel),
];
const DATE_FIRST_MOCK: &[Column] = &[
    column(SlotKind::FourSubject, TotalField::RawScore),
    column(SlotKind::FourSubject, TotalField::PercentileDeviation),
    column(SlotKind::FourSubject, TotalField::Rank),
    column(SlotKind::TwoSubject, TotalField::RawScore),
    column(SlotKind::TwoSubject, TotalField::PercentileDeviation),
    column(SlotKind::TwoSubject, TotalField::Rank),
];

const LAYOUTS: &[LayoutTemplate] = &[
    LayoutTemplate {
        variant: LayoutVariant::RoundFirst,
        order: RowOrder::RoundThenDate,
        header_phrases: &["実施回", "成績推移", "round", "score history"],
        sections: &[
            SectionTemplate {
                category: TestCategory::PeriodicGrowth,
                start_markers: GROWTH_START,
                end_markers: GROWTH_END,
                columns: ROUND_FIRST_GROWTH,
            },
            SectionTemplate {
                category: TestCategory::OpenMock,
                start_markers: MOCK_START,
                end_markers: MOCK_END,
                columns: ROUND_FIRST_MOCK,
            },
        ],
    },
    LayoutTemplate {
        variant: LayoutVariant::DateFirst,
        order: RowOrder::DateThenRound,
        header_phrases: &["平均との差", "平均差", "順位", "vs average", "rank"],
        sections: &[
            SectionTemplate {
                category: TestCategory::PeriodicGrowth,
                start_markers: GROWTH_START,
                end_markers: GROWTH_END,
                columns: DATE_FIRST_GROWTH,
            },
            SectionTemplate {
                category: TestCategory::OpenMock,
                start_markers: MOCK_START,
                end_markers: MOCK_END,
                columns: DATE_FIRST_MOCK,
            },
        ],
    },
];

const ROUND_TOKEN: &str = r"(?:第\s*|(?i:round|no\.?)\s*)?(?P<round>\d{1,3})\s*回?(?:\s*(?P<name>\S*?(?:テスト|模試|[Tt]est|[Ee]xam)))?";
const DATE_TOKEN: &str = r"(?P<date>\d{4}\s*[/.\-年]\s*\d{1,2}(?:\s*[/.\-月]\s*\d{1,2}\s*日?)?\s*月?|\d{4}\s*年?|\S+)";
const NUMBER_TOKEN: &str = r"[+\-]?\d+(?:\.\d+)?|[‐‒–—―ーｰ\-]";

pub struct SectionSpec {
    pub category: TestCategory,
    pub start_markers: Vec<Regex>,
    pub end_markers: Vec<Regex>,
    pub row: Regex,
    pub columns: &'static [Column],
}

impl SectionSpec {
    /// Earliest start marker wins; the block ends at the earliest end marker after it,
    /// or runs to the end of the text.
    pub fn slice<'a>(&self, text: &'a str) -> Option<&'a str> {
        let start = self
            .start_markers
            .iter()
            .filter_map(|marker| marker.find(text))
            .min_by_key(|found| found.start())?;

        let body = &text[start.end()..];
        let end = self
            .end_markers
            .iter()
            .filter_map(|marker| marker.find(body))
            .map(|found| found.start())
            .min()
            .unwrap_or(body.len());

        Some(&body[..end])
    }
}

pub struct LayoutDescriptor {
    pub variant: LayoutVariant,
    pub header_phrases: &'static [&'static str],
    pub sections: Vec<SectionSpec>,
}

pub struct LayoutCatalog {
    descriptors: Vec<LayoutDescriptor>,
}

impl LayoutCatalog {
    pub fn new() -> Result<Self> {
        let mut descriptors = Vec::with_capacity(LAYOUTS.len());

        for template in LAYOUTS {
            let mut sections = Vec::with_capacity(template.sections.len());
            for section in template.sections {
                let row_pattern = build_row_pattern(template.order, section.columns.len());
                sections.push(SectionSpec {
                    category: section.category,
                    start_markers: compile_all(section.start_markers, template.variant, "start")?,
                    end_markers: compile_all(section.end_markers, template.variant, "end")?,
                    row: Regex::new(&row_pattern).with_context(|| {
                        format!(
                            "failed to compile {} row regex for {}",
                            section.category.as_str(),
                            template.variant
                        )
                    })?,
                    columns: section.columns,
                });
            }

            descriptors.push(LayoutDescriptor {
                variant: template.variant,
                header_phrases: template.header_phrases,
                sections,
            });
        }

        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[LayoutDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, variant: LayoutVariant) -> Option<&LayoutDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.variant == variant)
    }
}

fn compile_all(
    patterns: &[&str],
    variant: LayoutVariant,
    kind: &str,
) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| {
                format!("failed to compile {kind} marker regex for {variant}: {pattern}")
            })
        })
        .collect()
}

fn build_row_pattern(order: RowOrder, field_count: usize) -> String {
    let fields = (0..field_count)
        .map(|index| format!(r"(?P<f{index}>{NUMBER_TOKEN})"))
        .collect::<Vec<String>>()
        .join(r"\s+");

    match order {
        RowOrder::RoundThenDate => {
            format!(r"^\s*{ROUND_TOKEN}\s+{DATE_TOKEN}\s+{fields}\s*$")
        }
        RowOrder::DateThenRound => {
            format!(r"^\s*{DATE_TOKEN}\s+{ROUND_TOKEN}\s+{fields}\s*$")
        }
    }
}
