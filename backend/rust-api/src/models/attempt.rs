use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::assessment::{AssessmentSummary, LearnerQuestion};
use super::not_blank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    InProgress,
    PendingReview,
    Passed,
    Failed,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::PendingReview => "PENDING_REVIEW",
            AttemptStatus::Passed => "PASSED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Expired => "EXPIRED",
        }
    }

    /// Submitted attempts count against the attempt limit, graded or not.
    pub fn is_finalized(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }

    /// Terminal attempts accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Passed | AttemptStatus::Failed | AttemptStatus::Expired
        )
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, AttemptStatus::Failed | AttemptStatus::Expired)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One learner's pass through an assessment. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub assessment_code: String,
    pub learner_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub status: AttemptStatus,
}

impl Attempt {
    pub fn start(assessment_code: &str, learner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assessment_code: assessment_code.to_string(),
            learner_id: learner_id.to_string(),
            started_at: now,
            finished_at: None,
            score: None,
            status: AttemptStatus::InProgress,
        }
    }

    pub fn deadline(&self, time_limit: Option<chrono::Duration>) -> Option<DateTime<Utc>> {
        time_limit.map(|limit| self.started_at + limit)
    }

    pub fn view(&self, time_limit: Option<chrono::Duration>) -> AttemptView {
        AttemptView {
            id: self.id.clone(),
            assessment_code: self.assessment_code.clone(),
            learner_id: self.learner_id.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            score: self.score,
            deadline: self.deadline(time_limit),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub id: String,
    pub assessment_code: String,
    pub learner_id: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    /// Advisory; expiry is enforced when the attempt is submitted.
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartAttemptRequest {
    #[validate(
        length(max = 128, message = "learner_id must be at most 128 characters"),
        custom(function = "not_blank")
    )]
    pub learner_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartAttemptResponse {
    pub attempt: AttemptView,
    pub assessment: AssessmentSummary,
    pub questions: Vec<LearnerQuestion>,
    /// Finalized attempts made before this one.
    pub previous_attempts: u32,
    /// True when an attempt already in progress was returned instead of a new one.
    pub resumed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingReviewQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReviewEntry {
    pub attempt_id: String,
    pub assessment_code: String,
    pub learner_id: String,
    pub started_at: DateTime<Utc>,
    pub provisional_score: Option<f64>,
    pub free_text_answers: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearnerHistoryQuery {
    pub assessment_code: Option<String>,
}
