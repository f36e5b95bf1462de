use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{GradingError, GradingResult};
use crate::models::{
    ApplyReviewRequest, ApplyReviewResponse, AttemptStatistics, AttemptStatus, FreeTextAnswer,
    FreeTextAnswersResponse, PendingReviewEntry, PendingReviewQuery, Question, QuestionKind,
};
use crate::services::attempt_service::AttemptService;
use crate::services::catalog::Catalog;
use crate::services::scoring::weighted_score;
use crate::store::AttemptStore;
use crate::utils::time::round2;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Instructor-facing side of grading: what is waiting for review, what an
/// attempt's free-text answers look like, and submission of corrections.
pub struct ReviewService {
    store: Arc<dyn AttemptStore>,
    catalog: Arc<dyn Catalog>,
    attempts: Arc<AttemptService>,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        catalog: Arc<dyn Catalog>,
        attempts: Arc<AttemptService>,
    ) -> Self {
        Self {
            store,
            catalog,
            attempts,
        }
    }

    /// Free-text answers of a PENDING_REVIEW attempt. Any other status is a
    /// conflict; listing never changes state.
    pub async fn list_pending_free_text(
        &self,
        attempt_id: &str,
    ) -> GradingResult<FreeTextAnswersResponse> {
        let (attempt, _, questions) = self.attempts.definition_for(attempt_id).await?;
        if attempt.status != AttemptStatus::PendingReview {
            return Err(GradingError::conflict(format!(
                "attempt {} is {}, not awaiting review",
                attempt.id, attempt.status
            )));
        }

        let free_text: HashMap<&str, &Question> = questions
            .iter()
            .filter(|q| q.kind == QuestionKind::FreeText)
            .map(|q| (q.id.as_str(), q))
            .collect();

        let answers: Vec<FreeTextAnswer> = self
            .store
            .answers(&attempt.id)
            .await?
            .into_iter()
            .filter_map(|answer| {
                let question = free_text.get(answer.question_id.as_str())?;
                Some(FreeTextAnswer {
                    answer_id: answer.id,
                    question_id: answer.question_id,
                    prompt: question.prompt.clone(),
                    weight: question.weight,
                    learner_response: answer.learner_response,
                    score: answer.score,
                    instructor_feedback: answer.instructor_feedback,
                })
            })
            .collect();

        Ok(FreeTextAnswersResponse {
            attempt_id: attempt.id,
            total: answers.len(),
            answers,
        })
    }

    pub async fn apply_review(
        &self,
        attempt_id: &str,
        request: ApplyReviewRequest,
    ) -> GradingResult<ApplyReviewResponse> {
        self.attempts.apply_review(attempt_id, request).await
    }

    /// PENDING_REVIEW attempts, oldest first.
    pub async fn pending_reviews(
        &self,
        query: PendingReviewQuery,
    ) -> GradingResult<Vec<PendingReviewEntry>> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(GradingError::validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = query.offset.unwrap_or(0);

        let attempts = self.store.pending_review(limit, offset).await?;
        let mut free_text_ids: HashMap<String, HashSet<String>> = HashMap::new();
        let mut entries = Vec::with_capacity(attempts.len());

        for attempt in attempts {
            if !free_text_ids.contains_key(&attempt.assessment_code) {
                let ids = self
                    .catalog
                    .questions(&attempt.assessment_code)
                    .await?
                    .into_iter()
                    .filter(|q| q.kind == QuestionKind::FreeText)
                    .map(|q| q.id)
                    .collect();
                free_text_ids.insert(attempt.assessment_code.clone(), ids);
            }
            let ids = free_text_ids.get(&attempt.assessment_code);

            let free_text_answers = self
                .store
                .answers(&attempt.id)
                .await?
                .iter()
                .filter(|a| ids.is_some_and(|ids| ids.contains(&a.question_id)))
                .count() as u32;

            entries.push(PendingReviewEntry {
                attempt_id: attempt.id,
                assessment_code: attempt.assessment_code,
                learner_id: attempt.learner_id,
                started_at: attempt.started_at,
                provisional_score: attempt.score,
                free_text_answers,
            });
        }

        Ok(entries)
    }

    pub async fn statistics(&self, attempt_id: &str) -> GradingResult<AttemptStatistics> {
        let (attempt, _, questions) = self.attempts.definition_for(attempt_id).await?;
        let answers = self.store.answers(&attempt.id).await?;

        let weights: HashMap<&str, f64> =
            questions.iter().map(|q| (q.id.as_str(), q.weight)).collect();

        let answered = answers
            .iter()
            .filter(|a| {
                a.learner_response
                    .as_deref()
                    .is_some_and(|r| !r.trim().is_empty())
            })
            .count() as u32;
        let scores: Vec<f64> = answers.iter().filter_map(|a| a.score).collect();
        let graded = scores.len() as u32;
        let total_questions = questions.len() as u32;

        let average_score = if scores.is_empty() {
            None
        } else {
            Some(round2(scores.iter().sum::<f64>() / scores.len() as f64))
        };
        let weighted = weighted_score(answers.iter().filter_map(|a| {
            weights
                .get(a.question_id.as_str())
                .map(|weight| (*weight, a.score))
        }));

        Ok(AttemptStatistics {
            attempt_id: attempt.id,
            status: attempt.status,
            total_questions,
            answered,
            graded,
            pending: total_questions.saturating_sub(graded),
            average_score,
            weighted_score: round2(weighted),
        })
    }
}
