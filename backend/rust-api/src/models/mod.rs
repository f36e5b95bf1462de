use validator::ValidationError;

pub mod answer;
pub mod assessment;
pub mod attempt;
pub mod enrollment;
pub mod event;

pub use answer::{
    Answer, ApplyReviewRequest, ApplyReviewResponse, AttemptStatistics, FreeTextAnswer,
    FreeTextAnswersResponse, NewAnswer, ReviewCorrection, SubmitAttemptRequest,
    SubmitAttemptResponse, SubmittedAnswer,
};
pub use assessment::{Assessment, AssessmentSummary, LearnerQuestion, Question, QuestionKind};
pub use attempt::{
    Attempt, AttemptStatus, AttemptView, LearnerHistoryQuery, PendingReviewEntry,
    PendingReviewQuery, StartAttemptRequest, StartAttemptResponse,
};
pub use enrollment::{Enrollment, EnrollmentStatus, ModuleProgress};
pub use event::{AssessmentEvent, OutcomeNotice};

/// Rejects identifiers that are empty or whitespace only.
pub(crate) fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("must not be blank".into());
        return Err(err);
    }
    Ok(())
}
