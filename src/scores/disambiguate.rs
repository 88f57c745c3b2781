use serde::{Deserialize, Serialize};
use tracing::info;

use super::classify::LabelClassifier;
use super::layout::{LayoutCatalog, LayoutDescriptor, LayoutVariant};
use super::normalize::normalize_width;
use super::table_parse::{ParsedTable, parse_with_layout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutHint {
    Auto,
    Declared(LayoutVariant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionBasis {
    Declared,
    Yield,
    HeaderHeuristic,
    Default,
}

impl SelectionBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionBasis::Declared => "declared",
            SelectionBasis::Yield => "yield",
            SelectionBasis::HeaderHeuristic => "header-heuristic",
            SelectionBasis::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateYield {
    pub variant: LayoutVariant,
    pub rows: usize,
    pub skipped_rows: usize,
    pub header_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSelection {
    pub chosen: LayoutVariant,
    pub basis: SelectionBasis,
    pub candidates: Vec<CandidateYield>,
}

#[derive(Debug)]
pub struct Disambiguated {
    pub selection: LayoutSelection,
    pub parsed: ParsedTable,
}

pub fn parse_transcript(
    text: &str,
    hint: LayoutHint,
    catalog: &LayoutCatalog,
    classifier: &LabelClassifier,
) -> Disambiguated {
    match hint {
        LayoutHint::Declared(variant) => match catalog.descriptor(variant) {
            Some(descriptor) => {
                let parsed = parse_with_layout(text, descriptor, classifier);
                Disambiguated {
                    selection: LayoutSelection {
                        chosen: variant,
                        basis: SelectionBasis::Declared,
                        candidates: vec![candidate_yield(text, descriptor, &parsed)],
                    },
                    parsed,
                }
            }
            None => disambiguate(text, catalog, classifier),
        },
        LayoutHint::Auto => disambiguate(text, catalog, classifier),
    }
}

/// Parses under every known layout and keeps the one with strictly the most rows.
/// Ties at the top go to header phrases, then to the primary layout.
pub fn disambiguate(
    text: &str,
    catalog: &LayoutCatalog,
    classifier: &LabelClassifier,
) -> Disambiguated {
    let mut runs = catalog
        .descriptors()
        .iter()
        .map(|descriptor| {
            let parsed = parse_with_layout(text, descriptor, classifier);
            (candidate_yield(text, descriptor, &parsed), parsed)
        })
        .collect::<Vec<(CandidateYield, ParsedTable)>>();

    let candidates = runs
        .iter()
        .map(|(candidate, _)| candidate.clone())
        .collect::<Vec<CandidateYield>>();
    let (chosen, basis) = choose_variant(&candidates);

    info!(
        chosen = %chosen,
        basis = ?basis,
        yields = %candidates
            .iter()
            .map(|candidate| format!("{}={}", candidate.variant, candidate.rows))
            .collect::<Vec<String>>()
            .join(","),
        "layout disambiguated"
    );

    let index = runs
        .iter()
        .position(|(candidate, _)| candidate.variant == chosen)
        .unwrap_or(0);
    let parsed = if runs.is_empty() {
        ParsedTable::default()
    } else {
        runs.swap_remove(index).1
    };

    Disambiguated {
        selection: LayoutSelection {
            chosen,
            basis,
            candidates,
        },
        parsed,
    }
}

pub fn choose_variant(candidates: &[CandidateYield]) -> (LayoutVariant, SelectionBasis) {
    let Some(best_rows) = candidates.iter().map(|candidate| candidate.rows).max() else {
        return (LayoutVariant::PRIMARY, SelectionBasis::Default);
    };

    let leaders = candidates
        .iter()
        .filter(|candidate| candidate.rows == best_rows)
        .collect::<Vec<&CandidateYield>>();
    if let [only] = leaders.as_slice() {
        return (only.variant, SelectionBasis::Yield);
    }

    let best_hits = leaders
        .iter()
        .map(|candidate| candidate.header_hits)
        .max()
        .unwrap_or(0);
    let header_leaders = leaders
        .iter()
        .filter(|candidate| candidate.header_hits == best_hits)
        .collect::<Vec<_>>();
    if best_hits > 0
        && let [only] = header_leaders.as_slice()
    {
        return (only.variant, SelectionBasis::HeaderHeuristic);
    }

    (LayoutVariant::PRIMARY, SelectionBasis::Default)
}

fn candidate_yield(
    text: &str,
    descriptor: &LayoutDescriptor,
    parsed: &ParsedTable,
) -> CandidateYield {
    CandidateYield {
        variant: descriptor.variant,
        rows: parsed.records.len(),
        skipped_rows: parsed.skipped_rows,
        header_hits: count_header_hits(text, descriptor.header_phrases),
    }
}

fn count_header_hits(text: &str, phrases: &[&str]) -> usize {
    let folded = normalize_width(text).to_lowercase();
    phrases
        .iter()
        .filter(|phrase| contains_phrase(&folded, &phrase.to_lowercase()))
        .count()
}

/// ASCII phrases must stand as whole words; Japanese phrases match anywhere, since the
/// script has no word separators.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    if !phrase.is_ascii() {
        return text.contains(phrase);
    }

    let is_word = |character: char| character.is_ascii_alphanumeric() || character == '_';
    text.match_indices(phrase).any(|(start, found)| {
        let before = text[..start].chars().next_back();
        let after = text[start + found.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}
