use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::DatePrecision;

const BLANK_CELL_MARKS: &[&str] = &[
    "-", "‐", "‑", "‒", "–", "—", "―", "−", "－", "ー", "ｰ",
];

static FULL_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[/.\-年]\s*(\d{1,2})\s*[/.\-月]\s*(\d{1,2})(?:[^\d]|$)")
        .expect("valid full date regex")
});
static YEAR_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[/.\-年]\s*(\d{1,2})(?:[^\d]|$)").expect("valid year-month regex")
});
static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid digit run regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LooseDate {
    pub date: NaiveDate,
    pub precision: DatePrecision,
}

/// Returns the value only when it lies inside `[min, max]`. Out-of-range values are
/// untrustworthy, so they are dropped rather than clipped to the boundary.
pub fn clamp_to_range(value: f64, min: f64, max: f64) -> Option<f64> {
    if value.is_finite() && value >= min && value <= max {
        Some(value)
    } else {
        None
    }
}

/// Blank table cells come through OCR as a lone dash of some flavour.
pub fn dash_to_null(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || BLANK_CELL_MARKS.contains(&trimmed) {
        None
    } else {
        Some(value)
    }
}

/// Folds full-width ASCII forms, the ideographic space and the minus sign to plain ASCII.
pub fn normalize_width(text: &str) -> String {
    text.chars()
        .map(|character| match character {
            '\u{FF01}'..='\u{FF5E}' => {
                char::from_u32(character as u32 - 0xFEE0).unwrap_or(character)
            }
            '\u{3000}' => ' ',
            '\u{2212}' | '\u{2010}' | '\u{2011}' => '-',
            _ => character,
        })
        .collect()
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn parse_number(token: &str) -> Option<f64> {
    let folded = normalize_width(token);
    let value = dash_to_null(&folded)?.trim();
    let value = value
        .trim_end_matches(['点', '位', '%'])
        .trim_start_matches('+')
        .replace(',', "");

    value.parse::<f64>().ok().filter(|parsed| parsed.is_finite())
}

/// Resolves a full, year-month or year-only fragment to a date, defaulting missing
/// month and day to the 1st. An impossible calendar day falls through to year-month.
pub fn parse_loose_date(text: &str) -> Option<LooseDate> {
    let folded = normalize_width(text);

    if let Some(captures) = FULL_DATE.captures(&folded) {
        let year = captures[1].parse::<i32>().ok();
        let month = captures[2].parse::<u32>().ok();
        let day = captures[3].parse::<u32>().ok();
        if let (Some(year), Some(month), Some(day)) = (year, month, day)
            && let Some(date) = NaiveDate::from_ymd_opt(year, month, day)
        {
            return Some(LooseDate {
                date,
                precision: DatePrecision::Day,
            });
        }
    }

    if let Some(captures) = YEAR_MONTH.captures(&folded) {
        let year = captures[1].parse::<i32>().ok();
        let month = captures[2].parse::<u32>().ok();
        if let (Some(year), Some(month)) = (year, month)
            && let Some(date) = NaiveDate::from_ymd_opt(year, month, 1)
        {
            return Some(LooseDate {
                date,
                precision: DatePrecision::Month,
            });
        }
    }

    let year = DIGIT_RUN
        .find_iter(&folded)
        .filter(|run| run.as_str().len() == 4)
        .filter_map(|run| run.as_str().parse::<i32>().ok())
        .find(|year| (2000..=2100).contains(year))?;

    NaiveDate::from_ymd_opt(year, 1, 1).map(|date| LooseDate {
        date,
        precision: DatePrecision::Year,
    })
}

/// Counts characters that carry content; a transcription with none is treated as absent.
pub fn non_whitespace_char_count(text: &str) -> usize {
    text.chars()
        .filter(|character| !character.is_whitespace())
        .count()
}
