use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Why a start request was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GatingReason {
    PrerequisitesIncomplete { modules: Vec<String> },
    NotEnrolled,
    /// Progress tracker unreachable or erroring; gating fails closed.
    ProgressUnavailable { detail: String },
    AlreadyPassed,
    AttemptLimitReached { used: u32, allowed: u32 },
    ReviewPending,
}

impl GatingReason {
    pub fn code(&self) -> &'static str {
        match self {
            GatingReason::PrerequisitesIncomplete { .. } => "prerequisites_incomplete",
            GatingReason::NotEnrolled => "not_enrolled",
            GatingReason::ProgressUnavailable { .. } => "progress_unavailable",
            GatingReason::AlreadyPassed => "already_passed",
            GatingReason::AttemptLimitReached { .. } => "attempt_limit_reached",
            GatingReason::ReviewPending => "review_pending",
        }
    }
}

impl std::fmt::Display for GatingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatingReason::PrerequisitesIncomplete { modules } => {
                write!(f, "mandatory modules not completed: {}", modules.join(", "))
            }
            GatingReason::NotEnrolled => write!(f, "learner is not enrolled in the course"),
            GatingReason::ProgressUnavailable { detail } => {
                write!(f, "progress tracker unavailable: {}", detail)
            }
            GatingReason::AlreadyPassed => write!(f, "assessment already passed"),
            GatingReason::AttemptLimitReached { used, allowed } => {
                write!(f, "attempt limit reached ({} used, {} allowed)", used, allowed)
            }
            GatingReason::ReviewPending => {
                write!(f, "a previous attempt is still awaiting review")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gating denied: {0}")]
    GatingDenied(GatingReason),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GradingError {
    pub fn validation(message: impl Into<String>) -> Self {
        GradingError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        GradingError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        GradingError::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GradingError::Internal(message.into())
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            GradingError::Validation(_) => "validation_failed",
            GradingError::NotFound { entity, .. } => match *entity {
                "assessment" => "assessment_not_found",
                "attempt" => "attempt_not_found",
                "answer" => "answer_not_found",
                _ => "not_found",
            },
            GradingError::Conflict(_) => "invalid_state",
            GradingError::GatingDenied(reason) => reason.code(),
            GradingError::Internal(_) => "internal_error",
        }
    }
}

impl From<StoreError> for GradingError {
    fn from(err: StoreError) -> Self {
        GradingError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for GradingError {
    fn from(err: validator::ValidationErrors) -> Self {
        GradingError::Validation(err.to_string())
    }
}

pub type GradingResult<T> = Result<T, GradingError>;
