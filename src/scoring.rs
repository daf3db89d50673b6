use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize, Serializer};

use crate::assemble::{Alternative, Answer};
use crate::reference::ReferenceQuestion;

/// Questions per exam day.
pub const QUESTIONS_PER_DAY: usize = 90;

/// The official answer to one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceAnswer {
    Alternative(Alternative),
    /// Excluded from scoring: every respondent answer counts as correct.
    Voided,
    /// The service listed the question without a correct alternative.
    Unknown,
}

impl ReferenceAnswer {
    pub fn accepts(self, answer: Answer) -> bool {
        match self {
            ReferenceAnswer::Voided => true,
            ReferenceAnswer::Alternative(correct) => answer.alternative() == Some(correct),
            ReferenceAnswer::Unknown => false,
        }
    }
}

impl fmt::Display for ReferenceAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceAnswer::Alternative(alternative) => write!(f, "{alternative}"),
            ReferenceAnswer::Voided => f.write_str("voided"),
            ReferenceAnswer::Unknown => f.write_str("?"),
        }
    }
}

impl Serialize for ReferenceAnswer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuestionDetail {
    pub question_number: u32,
    pub respondent_answer: Answer,
    pub correct_answer: ReferenceAnswer,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectionResult {
    pub correct_count: u32,
    pub total_compared: u32,
    pub details: Vec<QuestionDetail>,
}

impl CorrectionResult {
    pub fn summary(&self) -> ScoreSummary {
        ScoreSummary {
            correct: self.correct_count,
            total: self.total_compared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub correct: u32,
    pub total: u32,
}

/// Zero-based slice of the full key a given exam day is scored against. Unknown
/// days fall back to the first day.
pub fn day_range(day: u8) -> Range<usize> {
    match day {
        2 => QUESTIONS_PER_DAY..2 * QUESTIONS_PER_DAY,
        _ => 0..QUESTIONS_PER_DAY,
    }
}

/// Compares the respondent's answers, in order, against the key for `day`.
///
/// Only as many questions as both sides have are compared. Question numbers in
/// the details are absolute, so day 2 starts at 91.
pub fn correct_answers(answers: &[Answer], key: &[ReferenceQuestion], day: u8) -> CorrectionResult {
    let range = day_range(day);
    let start = range.start;
    let day_key = key.get(range.start..range.end.min(key.len())).unwrap_or_default();

    let details: Vec<QuestionDetail> = answers
        .iter()
        .zip(day_key)
        .enumerate()
        .map(|(i, (&respondent_answer, question))| QuestionDetail {
            question_number: (start + i + 1) as u32,
            respondent_answer,
            correct_answer: question.correct,
            is_correct: question.correct.accepts(respondent_answer),
        })
        .collect();

    let correct_count = details.iter().filter(|d| d.is_correct).count() as u32;
    log::info!(
        "{correct_count}/{} correct on day {day} ({} questions in key)",
        details.len(),
        day_key.len()
    );
    CorrectionResult {
        correct_count,
        total_compared: details.len() as u32,
        details,
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn question(index: u32, correct: ReferenceAnswer) -> ReferenceQuestion {
        ReferenceQuestion {
            index,
            title: format!("Questão {index}"),
            correct,
            language: None,
        }
    }

    fn key_of(len: u32, correct: ReferenceAnswer) -> Vec<ReferenceQuestion> {
        (1..=len).map(|i| question(i, correct)).collect()
    }

    fn marked(alternative: Alternative) -> Answer {
        Answer::Marked(alternative)
    }

    #[test]
    fn test_check_against_reference() {
        let a = ReferenceAnswer::Alternative(Alternative::A);
        assert!(a.accepts(marked(Alternative::A)));
        assert!(!a.accepts(marked(Alternative::B)));
        assert!(!a.accepts(Answer::Unmarked));
        assert!(ReferenceAnswer::Voided.accepts(Answer::Unmarked));
        assert!(!ReferenceAnswer::Unknown.accepts(marked(Alternative::A)));
    }

    #[test]
    fn test_voided_question_is_always_correct() {
        let mut key = key_of(90, ReferenceAnswer::Alternative(Alternative::C));
        key[4].correct = ReferenceAnswer::Voided;
        for answer in [marked(Alternative::A), marked(Alternative::E), Answer::Unmarked] {
            let answers = vec![answer; 90];
            let result = correct_answers(&answers, &key, 1);
            assert_eq!(result.details[4].question_number, 5);
            assert!(result.details[4].is_correct);
            assert!(!result.details[3].is_correct);
        }
    }

    #[test]
    fn test_second_day_uses_second_half() {
        let mut key = key_of(90, ReferenceAnswer::Alternative(Alternative::A));
        key.extend((91..=180).map(|i| question(i, ReferenceAnswer::Alternative(Alternative::B))));
        let answers = vec![marked(Alternative::B); 90];

        let result = correct_answers(&answers, &key, 2);
        assert_eq!(result.total_compared, 90);
        assert_eq!(result.correct_count, 90);
        assert_eq!(result.details[0].question_number, 91);
        assert_eq!(result.details[89].question_number, 180);

        let unknown_day = correct_answers(&answers, &key, 7);
        assert_eq!(unknown_day.correct_count, 0);
        assert_eq!(unknown_day.details[0].question_number, 1);
    }

    #[test]
    fn test_compares_the_shorter_side() {
        let key = key_of(90, ReferenceAnswer::Alternative(Alternative::D));
        let answers = vec![marked(Alternative::D); 45];
        let result = correct_answers(&answers, &key, 1);
        assert_eq!(result.total_compared, 45);
        assert_eq!(result.summary(), ScoreSummary { correct: 45, total: 45 });

        let short_key = key_of(100, ReferenceAnswer::Voided);
        let result = correct_answers(&vec![Answer::Unmarked; 90], &short_key, 2);
        assert_eq!(result.total_compared, 10);
    }

    #[test]
    fn test_empty_key_compares_nothing() {
        let result = correct_answers(&[marked(Alternative::A)], &[], 2);
        assert_eq!(result, CorrectionResult::default());
    }

    #[test]
    fn test_detail_serializes_letters() {
        let key = vec![question(1, ReferenceAnswer::Voided)];
        let result = correct_answers(&[Answer::Unmarked], &key, 1);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["details"][0]["respondent_answer"], "-");
        assert_eq!(json["details"][0]["correct_answer"], "voided");
        assert_eq!(json["details"][0]["is_correct"], true);
    }
}
