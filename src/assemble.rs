//! Turns per-row decisions into the answer vector and the bubbled respondent
//! identifier.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bubbles::{detect_bubbles, BubbleCandidate};
use crate::config::IdentifierConfig;
use crate::errors::SheetError;
use crate::fill::{classify_row, fill_score, mask_radius, FillScore, RowDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Alternative {
    A,
    B,
    C,
    D,
    E,
}

impl Alternative {
    pub const ALL: [Alternative; 5] = [
        Alternative::A,
        Alternative::B,
        Alternative::C,
        Alternative::D,
        Alternative::E,
    ];

    pub fn from_index(index: usize) -> Option<Alternative> {
        Alternative::ALL.get(index).copied()
    }

    pub fn letter(self) -> char {
        match self {
            Alternative::A => 'A',
            Alternative::B => 'B',
            Alternative::C => 'C',
            Alternative::D => 'D',
            Alternative::E => 'E',
        }
    }
}

impl FromStr for Alternative {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Alternative::A),
            "B" => Ok(Alternative::B),
            "C" => Ok(Alternative::C),
            "D" => Ok(Alternative::D),
            "E" => Ok(Alternative::E),
            other => Err(format!("`{other}` is not an alternative")),
        }
    }
}

impl fmt::Display for Alternative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A respondent's answer to one question. Serialized as its letter, or `-` when
/// nothing was marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Answer {
    Marked(Alternative),
    #[default]
    Unmarked,
}

pub const UNMARKED: &str = "-";

impl Answer {
    pub fn alternative(self) -> Option<Alternative> {
        match self {
            Answer::Marked(alt) => Some(alt),
            Answer::Unmarked => None,
        }
    }

    pub fn from_decision(decision: &RowDecision) -> Answer {
        decision
            .column()
            .and_then(Alternative::from_index)
            .map_or(Answer::Unmarked, Answer::Marked)
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Marked(alt) => write!(f, "{alt}"),
            Answer::Unmarked => f.write_str(UNMARKED),
        }
    }
}

impl FromStr for Answer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == UNMARKED {
            return Ok(Answer::Unmarked);
        }
        s.parse().map(Answer::Marked)
    }
}

impl Serialize for Answer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Answer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Collects answers from any number of blocks and pages. The first value written
/// for a question is kept.
#[derive(Debug, Clone, Default)]
pub struct AnswerSheetBuilder {
    answers: BTreeMap<u32, Answer>,
}

impl AnswerSheetBuilder {
    pub fn new() -> AnswerSheetBuilder {
        AnswerSheetBuilder::default()
    }

    /// Returns `false` when `question` already had an answer.
    pub fn record(&mut self, question: u32, answer: Answer) -> bool {
        if self.answers.contains_key(&question) {
            log::debug!("question {question} already answered, keeping first value");
            return false;
        }
        self.answers.insert(question, answer);
        true
    }

    /// Records one decision per row, numbering from `first_question`.
    pub fn record_rows(&mut self, first_question: u32, decisions: &[RowDecision]) -> usize {
        decisions
            .iter()
            .zip(first_question..)
            .filter(|(decision, question)| self.record(*question, Answer::from_decision(decision)))
            .count()
    }

    /// Records a contiguous vector that starts at question `offset + 1`.
    pub fn record_vector(&mut self, offset: u32, answers: &[Answer]) -> usize {
        answers
            .iter()
            .zip(offset + 1..)
            .filter(|(answer, question)| self.record(*question, **answer))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Answers for questions `1..=max`, unmarked wherever no block wrote one.
    pub fn finish(self) -> Vec<Answer> {
        let Some(&max) = self.answers.keys().next_back() else {
            return Vec::new();
        };
        (1..=max)
            .map(|q| self.answers.get(&q).copied().unwrap_or_default())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierSymbol {
    Digit(u8),
    Unreadable,
}

/// The bubbled respondent code, one symbol per digit column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierCode {
    symbols: Vec<IdentifierSymbol>,
    placeholder: char,
}

impl IdentifierCode {
    pub fn new(symbols: Vec<IdentifierSymbol>, placeholder: char) -> IdentifierCode {
        IdentifierCode {
            symbols,
            placeholder,
        }
    }

    /// Digits read back, anything else read as `placeholder`.
    pub fn parse(text: &str, placeholder: char) -> IdentifierCode {
        let symbols = text
            .chars()
            .map(|c| match c.to_digit(10) {
                Some(d) => IdentifierSymbol::Digit(d as u8),
                None => IdentifierSymbol::Unreadable,
            })
            .collect();
        IdentifierCode::new(symbols, placeholder)
    }

    pub fn symbols(&self) -> &[IdentifierSymbol] {
        &self.symbols
    }

    pub fn readable_digits(&self) -> usize {
        self.symbols
            .iter()
            .filter(|s| matches!(s, IdentifierSymbol::Digit(_)))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.readable_digits() == self.symbols.len()
    }
}

impl fmt::Display for IdentifierCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for symbol in &self.symbols {
            match symbol {
                IdentifierSymbol::Digit(d) => write!(f, "{d}")?,
                IdentifierSymbol::Unreadable => write!(f, "{}", self.placeholder)?,
            }
        }
        Ok(())
    }
}

impl Serialize for IdentifierCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdentifierCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let placeholder = text.chars().find(|c| !c.is_ascii_digit()).unwrap_or('?');
        Ok(IdentifierCode::parse(&text, placeholder))
    }
}

/// One digit column of the identifier region, top to bottom.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigitColumn {
    pub bubbles: Vec<BubbleCandidate>,
    pub scores: Vec<FillScore>,
    pub decision: RowDecision,
    pub symbol_index: Option<u8>,
}

#[derive(Debug)]
pub struct IdentifierReading {
    pub code: IdentifierCode,
    pub columns: Vec<DigitColumn>,
}

/// Groups candidates into columns by the left edge of their boxes. A column keeps
/// the x of its first member, and a candidate starting `max_distance` or more
/// away opens the next one.
pub fn group_columns(candidates: &[BubbleCandidate], max_distance: f64) -> Vec<Vec<BubbleCandidate>> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|c| (c.x, c.y));

    let mut columns: Vec<Vec<BubbleCandidate>> = Vec::new();
    let mut column_x = i32::MIN;
    for candidate in sorted {
        match columns.last_mut() {
            Some(column) if ((candidate.x - column_x) as f64).abs() < max_distance => {
                column.push(candidate)
            }
            _ => {
                column_x = candidate.x;
                columns.push(vec![candidate]);
            }
        }
    }
    for column in &mut columns {
        column.sort_by_key(|c| c.y);
    }
    columns
}

/// Digit of the `marked` bubble in a column sorted top to bottom.
///
/// A full column reads by rank. With missing bubbles the digit comes from the
/// distance to the first bubble in units of the median row pitch. The last
/// detected bubble is not used: stretching the first-to-last span over all
/// rows misreads every digit when the bottom bubble is the one missing. A
/// missing top bubble still shifts the result, since the first detected
/// bubble is taken as digit 0.
pub fn digit_index(column: &[BubbleCandidate], marked: usize, expected_rows: usize) -> usize {
    let last = expected_rows.saturating_sub(1);
    if column.len() >= expected_rows || column.len() < 2 {
        return marked.min(last);
    }
    let ys: Vec<i32> = column.iter().map(|c| c.y).collect();
    let Some(pitch) = crate::grid::median_gap(&ys).filter(|p| *p > 0.0) else {
        return marked.min(last);
    };
    let relative = (ys[marked] - ys[0]) as f64 / pitch;
    (relative.round().max(0.0) as usize).min(last)
}

/// Reads the bubbled identifier from a grayscale region.
///
/// A column with nothing marked yields the placeholder. Fails with
/// `CodeUnreadable` when fewer than `min_readable_digits` columns read a digit.
pub fn decode_identifier(
    region: &Mat,
    config: &IdentifierConfig,
    threshold: f64,
) -> Result<IdentifierReading, SheetError> {
    let detection = detect_bubbles(region, &config.detector, config.columns)?;
    let max_distance = region.cols() as f64 * config.column_distance_frac;
    let grouped = group_columns(&detection.candidates, max_distance);
    if grouped.len() != config.columns {
        log::warn!(
            "identifier: found {} bubble columns, expected {}",
            grouped.len(),
            config.columns
        );
    }

    let mut columns = Vec::with_capacity(config.columns);
    let mut symbols = Vec::with_capacity(config.columns);
    for (idx, bubbles) in grouped.into_iter().take(config.columns).enumerate() {
        let scores = bubbles
            .iter()
            .map(|b| {
                let radius = mask_radius(b.width as f64, config.radius_factor, 1);
                fill_score(&detection.binary, b.center, radius)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let decision = classify_row(&scores, threshold);
        let symbol_index = decision
            .column()
            .map(|marked| digit_index(&bubbles, marked, config.rows) as u8);
        match symbol_index {
            Some(digit) => {
                log::debug!("identifier column {}: digit {digit}", idx + 1);
                symbols.push(IdentifierSymbol::Digit(digit));
            }
            None => {
                log::debug!("identifier column {}: nothing marked", idx + 1);
                symbols.push(IdentifierSymbol::Unreadable);
            }
        }
        columns.push(DigitColumn {
            bubbles,
            scores,
            decision,
            symbol_index,
        });
    }
    symbols.resize(config.columns, IdentifierSymbol::Unreadable);

    let code = IdentifierCode::new(symbols, config.placeholder);
    let readable = code.readable_digits();
    if readable < config.min_readable_digits {
        return Err(SheetError::CodeUnreadable {
            partial: code,
            readable,
        });
    }
    Ok(IdentifierReading { code, columns })
}
