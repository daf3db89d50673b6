//! Official answer keys, fetched from the public exam API.

use std::future::Future;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::assemble::{Alternative, Answer};
use crate::config::ReferenceConfig;
use crate::errors::{fmt_error_chain_of, ReferenceError};
use crate::scoring::{correct_answers, CorrectionResult, ReferenceAnswer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceQuestion {
    pub index: u32,
    pub title: String,
    pub correct: ReferenceAnswer,
    pub language: Option<String>,
}

impl ReferenceQuestion {
    /// Stand-in for a question the service would not return.
    pub fn voided(index: u32) -> ReferenceQuestion {
        ReferenceQuestion {
            index,
            title: format!("Questão {index}"),
            correct: ReferenceAnswer::Voided,
            language: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionPayload {
    index: u32,
    title: String,
    correct_alternative: Option<String>,
    language: Option<String>,
}

impl From<QuestionPayload> for ReferenceQuestion {
    fn from(payload: QuestionPayload) -> Self {
        let correct = match payload.correct_alternative.as_deref().map(str::parse::<Alternative>) {
            Some(Ok(alternative)) => ReferenceAnswer::Alternative(alternative),
            Some(Err(_)) | None => ReferenceAnswer::Unknown,
        };
        ReferenceQuestion {
            index: payload.index,
            title: payload.title,
            correct,
            language: payload.language,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExamPayload {
    #[serde(default)]
    questions: Vec<serde_json::Value>,
}

/// Anything that can produce the full, ordered answer key of an exam year.
pub trait AnswerKeySource {
    fn fetch_key(
        &self,
        year: u32,
        language: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ReferenceQuestion>, ReferenceError>> + Send;
}

pub struct EnemApiClient {
    client: reqwest::Client,
    base_url: String,
    default_question_count: u32,
    max_concurrent: usize,
}

impl EnemApiClient {
    pub fn new(config: &ReferenceConfig) -> EnemApiClient {
        EnemApiClient {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_question_count: config.default_question_count,
            max_concurrent: config.max_concurrent_requests.max(1),
        }
    }

    async fn get(&self, url: String, language: Option<&str>) -> Result<reqwest::Response, ReferenceError> {
        let mut request = self.client.get(&url);
        if let Some(language) = language {
            request = request.query(&[("language", language)]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReferenceError::Status { status, url });
        }
        Ok(response)
    }

    /// Number of questions the exam lists, or the configured default when the
    /// listing does not say.
    async fn question_count(&self, year: u32) -> Result<u32, ReferenceError> {
        let exam: ExamPayload = self
            .get(format!("{}/exams/{year}", self.base_url), None)
            .await?
            .json()
            .await?;
        if exam.questions.is_empty() {
            Ok(self.default_question_count)
        } else {
            Ok(exam.questions.len() as u32)
        }
    }

    async fn try_fetch_question(
        &self,
        year: u32,
        index: u32,
        language: Option<&str>,
    ) -> Result<ReferenceQuestion, ReferenceError> {
        let payload: QuestionPayload = self
            .get(
                format!("{}/exams/{year}/questions/{index}", self.base_url),
                language,
            )
            .await?
            .json()
            .await?;
        Ok(payload.into())
    }

    async fn fetch_question(&self, year: u32, index: u32, language: Option<&str>) -> ReferenceQuestion {
        match self.try_fetch_question(year, index, language).await {
            Ok(question) => question,
            Err(e) => {
                log::warn!("question {index} treated as voided: {e}");
                ReferenceQuestion::voided(index)
            }
        }
    }
}

impl AnswerKeySource for EnemApiClient {
    async fn fetch_key(
        &self,
        year: u32,
        language: Option<&str>,
    ) -> Result<Vec<ReferenceQuestion>, ReferenceError> {
        let count = self.question_count(year).await?;
        log::info!("fetching {count} questions of {year}");
        let questions = futures::stream::iter(1..=count)
            .map(|index| self.fetch_question(year, index, language))
            .buffered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;
        Ok(questions)
    }
}

/// The answer key, or an empty one when the service is unavailable. The cause
/// is only logged.
pub async fn key_or_empty<S: AnswerKeySource>(
    source: &S,
    year: u32,
    language: Option<&str>,
) -> Vec<ReferenceQuestion> {
    match source.fetch_key(year, language).await {
        Ok(key) => key,
        Err(e) => {
            log::warn!(
                "reference key for {year} unavailable, nothing corrected: {}",
                fmt_error_chain_of(&e)
            );
            Vec::new()
        }
    }
}

/// Fetches the key and corrects `answers` against it.
///
/// An unavailable service yields an empty result.
pub async fn correct_sheet<S: AnswerKeySource>(
    source: &S,
    answers: &[Answer],
    year: u32,
    day: u8,
    language: Option<&str>,
) -> CorrectionResult {
    let key = key_or_empty(source, year, language).await;
    correct_answers(answers, &key, day)
}

/// Corrects every sheet against a single fetch of the key.
pub async fn correct_batch<S: AnswerKeySource>(
    source: &S,
    sheets: &[&[Answer]],
    year: u32,
    day: u8,
    language: Option<&str>,
) -> Vec<CorrectionResult> {
    if sheets.is_empty() {
        return Vec::new();
    }
    let key = key_or_empty(source, year, language).await;
    sheets
        .iter()
        .map(|answers| correct_answers(answers, &key, day))
        .collect()
}
