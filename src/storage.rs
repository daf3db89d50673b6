use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assemble::{Answer, IdentifierCode};
use crate::errors::{CsvError, RegistryError};
use crate::scoring::{CorrectionResult, ScoreSummary};

#[derive(Debug, Serialize)]
struct AnswerRow {
    question: u32,
    answer: Answer,
}

#[derive(Debug, Serialize)]
struct CorrectionRow {
    question: u32,
    respondent_answer: String,
    correct_answer: String,
    is_correct: bool,
}

pub fn write_answers_csv<W: Write>(answers: &[Answer], writer: W) -> Result<(), CsvError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for (i, &answer) in answers.iter().enumerate() {
        wtr.serialize(AnswerRow {
            question: i as u32 + 1,
            answer,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_correction_csv<W: Write>(result: &CorrectionResult, writer: W) -> Result<(), CsvError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for detail in &result.details {
        wtr.serialize(CorrectionRow {
            question: detail.question_number,
            respondent_answer: detail.respondent_answer.to_string(),
            correct_answer: detail.correct_answer.to_string(),
            is_correct: detail.is_correct,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn export_answers_csv(answers: &[Answer], path: &Path) -> Result<(), CsvError> {
    write_answers_csv(answers, File::create(path)?)
}

pub fn export_correction_csv(result: &CorrectionResult, path: &Path) -> Result<(), CsvError> {
    write_correction_csv(result, File::create(path)?)
}

/// One correction of one respondent. Entries are never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub exam_year: u32,
    pub exam_day: u8,
    pub language: Option<String>,
    pub score_summary: ScoreSummary,
}

impl HistoryEntry {
    pub fn now(exam_year: u32, exam_day: u8, language: Option<String>, result: &CorrectionResult) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            exam_year,
            exam_day,
            language,
            score_summary: result.summary(),
        }
    }
}

pub trait RespondentRegistry {
    fn append(&mut self, respondent: &IdentifierCode, entry: HistoryEntry) -> Result<(), RegistryError>;
    fn history(&self, respondent: &IdentifierCode) -> Vec<HistoryEntry>;
}

/// Registry kept as one JSON object mapping respondent codes to their history.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    entries: BTreeMap<String, Vec<HistoryEntry>>,
}

impl JsonFileRegistry {
    /// Opens the registry at `path`; a missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<JsonFileRegistry, RegistryError> {
        let path = path.into();
        let entries = if path.try_exists()? {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(JsonFileRegistry { path, entries })
    }

    pub fn respondents(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn persist(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RespondentRegistry for JsonFileRegistry {
    fn append(&mut self, respondent: &IdentifierCode, entry: HistoryEntry) -> Result<(), RegistryError> {
        self.entries
            .entry(respondent.to_string())
            .or_default()
            .push(entry);
        self.persist()?;
        log::info!("history of {respondent} saved to {}", self.path.display());
        Ok(())
    }

    fn history(&self, respondent: &IdentifierCode) -> Vec<HistoryEntry> {
        self.entries
            .get(&respondent.to_string())
            .cloned()
            .unwrap_or_default()
    }
}
