use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::attempt::AttemptStatus;
use super::not_blank;

/// Stored answer, unique per (attempt_id, question_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub attempt_id: String,
    pub question_id: String,
    pub learner_response: Option<String>,
    /// Per-question score 0..100 before weighting; None until graded.
    pub score: Option<f64>,
    pub instructor_feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert-or-replace payload keyed on (attempt_id, question_id).
#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub attempt_id: String,
    pub question_id: String,
    pub learner_response: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmittedAnswer {
    #[validate(custom(function = "not_blank"))]
    pub question_id: String,

    #[validate(length(max = 10000, message = "response must be at most 10000 characters"))]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAttemptRequest {
    #[serde(default)]
    #[validate(nested)]
    pub answers: Vec<SubmittedAnswer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitAttemptResponse {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub score: Option<f64>,
    pub pass_threshold: f64,
    pub has_free_text: bool,
    pub pending_free_text: u32,
    pub answers_saved: u32,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReviewCorrection {
    #[validate(custom(function = "not_blank"))]
    pub answer_id: String,

    #[validate(range(min = 0.0, max = 100.0, message = "score must be between 0 and 100"))]
    pub score: f64,

    #[validate(length(max = 5000, message = "feedback must be at most 5000 characters"))]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplyReviewRequest {
    #[validate(
        length(min = 1, message = "at least one correction is required"),
        nested
    )]
    pub corrections: Vec<ReviewCorrection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyReviewResponse {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub score: f64,
    pub pass_threshold: f64,
    pub passed: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
}

/// Free-text answer as presented to an instructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTextAnswer {
    pub answer_id: String,
    pub question_id: String,
    pub prompt: String,
    pub weight: f64,
    pub learner_response: Option<String>,
    pub score: Option<f64>,
    pub instructor_feedback: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FreeTextAnswersResponse {
    pub attempt_id: String,
    pub answers: Vec<FreeTextAnswer>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStatistics {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub total_questions: u32,
    pub answered: u32,
    pub graded: u32,
    pub pending: u32,
    /// Unweighted mean of graded per-question scores.
    pub average_score: Option<f64>,
    pub weighted_score: f64,
}
