//! Attempt lifecycle controller.
//!
//! ```text
//! (none) --start--> IN_PROGRESS --submit--> PENDING_REVIEW --review--> PASSED | FAILED
//!                        |  \--submit (objective only)----------------> PASSED | FAILED
//!                        \----submit after time limit----------------> EXPIRED
//! ```
//!
//! Every transition runs in one store unit of work; outcome notices are
//! dispatched only after the commit succeeds.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

use crate::error::{GatingReason, GradingError, GradingResult};
use crate::metrics::{
    ANSWERS_GRADED_TOTAL, ATTEMPTS_FINALIZED_TOTAL, ATTEMPTS_STARTED_TOTAL, GATING_DENIED_TOTAL,
};
use crate::models::{
    ApplyReviewRequest, ApplyReviewResponse, Assessment, Attempt, AttemptStatus, AttemptView,
    NewAnswer, OutcomeNotice, Question, QuestionKind, StartAttemptRequest, StartAttemptResponse,
    SubmitAttemptRequest, SubmitAttemptResponse,
};
use crate::services::catalog::{Catalog, CatalogError};
use crate::services::outcome_service::OutcomeDispatcher;
use crate::services::progress_client::ProgressClient;
use crate::services::scoring::{grade_objective, verdict, weighted_score};
use crate::store::{AttemptStore, StoreError, UnitOfWork};
use crate::utils::time::round2;

/// Source of "now" for the controller.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

impl From<CatalogError> for GradingError {
    fn from(err: CatalogError) -> Self {
        GradingError::internal(err.to_string())
    }
}

/// Retry policy over a learner's attempts on one assessment.
///
/// A PASSED attempt closes the assessment. Otherwise up to `allowed`
/// submitted attempts are permitted, plus one recovery attempt when every
/// one of them failed or expired.
pub(crate) fn check_retry_policy(history: &[Attempt], allowed: u32) -> Result<(), GatingReason> {
    if history.iter().any(|a| a.status == AttemptStatus::Passed) {
        return Err(GatingReason::AlreadyPassed);
    }

    let finalized: Vec<&Attempt> = history.iter().filter(|a| a.status.is_finalized()).collect();
    let used = finalized.len() as u32;

    if used < allowed {
        return Ok(());
    }
    if used == allowed {
        if finalized.iter().all(|a| a.status.is_unsuccessful()) {
            return Ok(());
        }
        return Err(GatingReason::ReviewPending);
    }
    Err(GatingReason::AttemptLimitReached { used, allowed })
}

/// Result of a submit or review transaction, handed back after commit.
struct Transition {
    attempt: Attempt,
    has_free_text: bool,
    pending_free_text: u32,
    answers_saved: u32,
    graded: Vec<(QuestionKind, bool)>,
}

pub struct AttemptService {
    store: Arc<dyn AttemptStore>,
    catalog: Arc<dyn Catalog>,
    progress: Arc<dyn ProgressClient>,
    outcomes: OutcomeDispatcher,
    gating_timeout: Duration,
    clock: Clock,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        catalog: Arc<dyn Catalog>,
        progress: Arc<dyn ProgressClient>,
        outcomes: OutcomeDispatcher,
        gating_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            progress,
            outcomes,
            gating_timeout,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub async fn start_attempt(
        &self,
        assessment_code: &str,
        request: StartAttemptRequest,
    ) -> GradingResult<StartAttemptResponse> {
        request.validate()?;
        let learner_id = request.learner_id.trim();

        let assessment = match self.catalog.assessment(assessment_code).await? {
            Some(a) if a.active => a,
            _ => return Err(GradingError::not_found("assessment", assessment_code)),
        };
        let questions = self.catalog.questions(assessment_code).await?;

        // Re-entry does not re-run gating
        let history = self.store.attempts_for(assessment_code, learner_id).await?;
        if let Some(open) = history.iter().find(|a| a.status == AttemptStatus::InProgress) {
            ATTEMPTS_STARTED_TOTAL.with_label_values(&["resumed"]).inc();
            return Ok(start_response(&assessment, &questions, open, &history, true));
        }

        self.check_prerequisites(&assessment, learner_id).await?;

        let mut uow = self.store.begin_learner(assessment_code, learner_id).await?;
        let opened = self.open_attempt(&mut *uow, &assessment, learner_id).await;

        let (attempt, history, resumed) = match opened {
            Ok(Some(opened)) if opened.2 => {
                rollback(uow).await;
                opened
            }
            Ok(Some(opened)) => match uow.commit().await {
                Ok(()) => opened,
                Err(StoreError::Duplicate(_)) => {
                    drop(uow);
                    self.concurrent_winner(assessment_code, learner_id).await?
                }
                Err(err) => return Err(err.into()),
            },
            Ok(None) => {
                rollback(uow).await;
                self.concurrent_winner(assessment_code, learner_id).await?
            }
            Err(err) => {
                rollback(uow).await;
                if let GradingError::GatingDenied(reason) = &err {
                    deny_log(assessment_code, learner_id, reason);
                }
                return Err(err);
            }
        };

        if resumed {
            ATTEMPTS_STARTED_TOTAL.with_label_values(&["resumed"]).inc();
        } else {
            ATTEMPTS_STARTED_TOTAL.with_label_values(&["created"]).inc();
            info!(
                attempt_id = %attempt.id,
                learner_id = %learner_id,
                status = %attempt.status,
                "Attempt started on {}",
                assessment_code
            );
        }

        Ok(start_response(&assessment, &questions, &attempt, &history, resumed))
    }

    /// Fail-closed prerequisite gate against the progress tracker.
    async fn check_prerequisites(
        &self,
        assessment: &Assessment,
        learner_id: &str,
    ) -> GradingResult<()> {
        let Some(course_id) = assessment.course_id.as_deref() else {
            return Ok(());
        };

        let lookup = tokio::time::timeout(
            self.gating_timeout,
            self.progress.enrollment(learner_id, course_id),
        )
        .await;

        let reason = match lookup {
            Err(_) => GatingReason::ProgressUnavailable {
                detail: format!(
                    "no response within {} ms",
                    self.gating_timeout.as_millis()
                ),
            },
            Ok(Err(err)) => GatingReason::ProgressUnavailable {
                detail: err.to_string(),
            },
            Ok(Ok(None)) => GatingReason::NotEnrolled,
            Ok(Ok(Some(enrollment))) => {
                let modules = enrollment.incomplete_prerequisites(assessment.module_id.as_deref());
                if modules.is_empty() {
                    return Ok(());
                }
                GatingReason::PrerequisitesIncomplete { modules }
            }
        };

        deny_log(&assessment.code, learner_id, &reason);
        Err(GradingError::GatingDenied(reason))
    }

    /// Returns `None` when a concurrent start won the uniqueness race.
    async fn open_attempt(
        &self,
        uow: &mut dyn UnitOfWork,
        assessment: &Assessment,
        learner_id: &str,
    ) -> GradingResult<Option<(Attempt, Vec<Attempt>, bool)>> {
        let history = uow.attempts_for(&assessment.code, learner_id).await?;
        if let Some(open) = history.iter().find(|a| a.status == AttemptStatus::InProgress) {
            return Ok(Some((open.clone(), history.clone(), true)));
        }

        check_retry_policy(&history, assessment.attempts_allowed())
            .map_err(GradingError::GatingDenied)?;

        let attempt = Attempt::start(&assessment.code, learner_id, self.now());
        match uow.insert_attempt(&attempt).await {
            Ok(()) => Ok(Some((attempt, history, false))),
            Err(StoreError::Duplicate(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn concurrent_winner(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> GradingResult<(Attempt, Vec<Attempt>, bool)> {
        let history = self.store.attempts_for(assessment_code, learner_id).await?;
        let winner = history
            .iter()
            .find(|a| a.status == AttemptStatus::InProgress)
            .cloned()
            .ok_or_else(|| {
                GradingError::internal(format!(
                    "concurrent start for {}/{} left no attempt in progress",
                    assessment_code, learner_id
                ))
            })?;
        Ok((winner, history, true))
    }

    pub async fn get_attempt(&self, attempt_id: &str) -> GradingResult<AttemptView> {
        let attempt = self
            .store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| GradingError::not_found("attempt", attempt_id))?;
        let time_limit = self
            .catalog
            .assessment(&attempt.assessment_code)
            .await?
            .and_then(|a| a.time_limit());
        Ok(attempt.view(time_limit))
    }

    /// Attempts of a learner, newest first, optionally for one assessment.
    pub async fn learner_history(
        &self,
        learner_id: &str,
        assessment_code: Option<&str>,
    ) -> GradingResult<Vec<Attempt>> {
        let learner_id = learner_id.trim();
        if learner_id.is_empty() {
            return Err(GradingError::validation("learner_id must not be blank"));
        }
        let attempts = self.store.learner_history(learner_id).await?;
        Ok(attempts
            .into_iter()
            .filter(|a| assessment_code.map_or(true, |code| a.assessment_code == code))
            .collect())
    }

    /// Loads the assessment definition an attempt was started against.
    pub(crate) async fn definition_for(
        &self,
        attempt_id: &str,
    ) -> GradingResult<(Attempt, Assessment, Vec<Question>)> {
        let attempt = self
            .store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| GradingError::not_found("attempt", attempt_id))?;
        let assessment = self
            .catalog
            .assessment(&attempt.assessment_code)
            .await?
            .ok_or_else(|| GradingError::not_found("assessment", &attempt.assessment_code))?;
        let questions = self.catalog.questions(&attempt.assessment_code).await?;
        Ok((attempt, assessment, questions))
    }

    pub async fn submit(
        &self,
        attempt_id: &str,
        request: SubmitAttemptRequest,
    ) -> GradingResult<SubmitAttemptResponse> {
        request.validate()?;

        let mut seen = HashSet::new();
        for answer in &request.answers {
            if !seen.insert(answer.question_id.trim()) {
                return Err(GradingError::validation(format!(
                    "question {} answered more than once",
                    answer.question_id.trim()
                )));
            }
        }

        let (_, assessment, questions) = self.definition_for(attempt_id).await?;
        let known: HashSet<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        if let Some(unknown) = seen.iter().find(|id| !known.contains(*id)) {
            return Err(GradingError::validation(format!(
                "question {} does not belong to assessment {}",
                unknown, assessment.code
            )));
        }

        let mut uow = self.store.begin_attempt(attempt_id).await?;
        let result = self
            .grade_submission(&mut *uow, &assessment, &questions, attempt_id, &request)
            .await;
        let transition = commit_or_rollback(uow, result).await?;

        for (kind, correct) in &transition.graded {
            ANSWERS_GRADED_TOTAL
                .with_label_values(&[kind.as_str(), if *correct { "correct" } else { "incorrect" }])
                .inc();
        }
        self.record_transition(&assessment, &transition.attempt);

        let attempt = &transition.attempt;
        let message = match attempt.status {
            AttemptStatus::Expired => "Time limit exceeded, attempt expired".to_string(),
            AttemptStatus::PendingReview => format!(
                "Submitted; {} free-text answer(s) awaiting review",
                transition.pending_free_text
            ),
            AttemptStatus::Passed => "Assessment passed".to_string(),
            _ => "Assessment failed".to_string(),
        };

        Ok(SubmitAttemptResponse {
            attempt_id: attempt.id.clone(),
            status: attempt.status,
            score: attempt.score,
            pass_threshold: assessment.pass_threshold(),
            has_free_text: transition.has_free_text,
            pending_free_text: transition.pending_free_text,
            answers_saved: transition.answers_saved,
            finished_at: attempt.finished_at,
            message,
        })
    }

    async fn grade_submission(
        &self,
        uow: &mut dyn UnitOfWork,
        assessment: &Assessment,
        questions: &[Question],
        attempt_id: &str,
        request: &SubmitAttemptRequest,
    ) -> GradingResult<Transition> {
        let mut attempt = uow
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| GradingError::not_found("attempt", attempt_id))?;

        if attempt.status != AttemptStatus::InProgress {
            return Err(GradingError::conflict(format!(
                "attempt {} is {} and cannot be submitted",
                attempt.id, attempt.status
            )));
        }

        let now = self.now();
        let has_free_text = questions.iter().any(|q| !q.kind.is_objective());

        if let Some(deadline) = attempt.deadline(assessment.time_limit()) {
            if now > deadline {
                attempt.status = AttemptStatus::Expired;
                attempt.score = Some(0.0);
                attempt.finished_at = Some(now);
                uow.update_attempt(&attempt).await?;
                return Ok(Transition {
                    attempt,
                    has_free_text,
                    pending_free_text: 0,
                    answers_saved: 0,
                    graded: Vec::new(),
                });
            }
        }

        let responses: HashMap<&str, Option<&str>> = request
            .answers
            .iter()
            .map(|a| (a.question_id.trim(), a.response.as_deref()))
            .collect();

        let mut entries = Vec::with_capacity(questions.len());
        let mut graded = Vec::new();
        let mut pending_free_text = 0;

        for question in questions {
            let response = responses.get(question.id.as_str()).copied().flatten();
            let score = if question.kind.is_objective() {
                let score = grade_objective(question, response);
                graded.push((question.kind, score > 0.0));
                Some(score)
            } else {
                pending_free_text += 1;
                None
            };

            uow.upsert_answer(NewAnswer {
                attempt_id: attempt.id.clone(),
                question_id: question.id.clone(),
                learner_response: response.map(str::to_string),
                score,
            })
            .await?;
            entries.push((question.weight, score));
        }

        let score = round2(weighted_score(entries));
        attempt.score = Some(score);
        if has_free_text {
            attempt.status = AttemptStatus::PendingReview;
        } else {
            attempt.status = verdict(score, assessment.pass_threshold());
            attempt.finished_at = Some(now);
        }
        uow.update_attempt(&attempt).await?;

        Ok(Transition {
            attempt,
            has_free_text,
            pending_free_text,
            answers_saved: questions.len() as u32,
            graded,
        })
    }

    pub async fn apply_review(
        &self,
        attempt_id: &str,
        request: ApplyReviewRequest,
    ) -> GradingResult<ApplyReviewResponse> {
        request.validate()?;

        let mut seen = HashSet::new();
        for correction in &request.corrections {
            if !correction.score.is_finite() {
                return Err(GradingError::validation("score must be a finite number"));
            }
            if !seen.insert(correction.answer_id.trim()) {
                return Err(GradingError::validation(format!(
                    "answer {} corrected more than once",
                    correction.answer_id.trim()
                )));
            }
        }

        let (_, assessment, questions) = self.definition_for(attempt_id).await?;

        let mut uow = self.store.begin_attempt(attempt_id).await?;
        let result = self
            .reconcile(&mut *uow, &assessment, &questions, attempt_id, &request)
            .await;
        let attempt = commit_or_rollback(uow, result).await?;

        self.record_transition(&assessment, &attempt);

        let score = attempt.score.unwrap_or(0.0);
        let passed = attempt.status == AttemptStatus::Passed;
        Ok(ApplyReviewResponse {
            attempt_id: attempt.id.clone(),
            status: attempt.status,
            score,
            pass_threshold: assessment.pass_threshold(),
            passed,
            finished_at: attempt.finished_at,
            message: if passed {
                "Review applied, assessment passed".to_string()
            } else {
                "Review applied, assessment failed".to_string()
            },
        })
    }

    async fn reconcile(
        &self,
        uow: &mut dyn UnitOfWork,
        assessment: &Assessment,
        questions: &[Question],
        attempt_id: &str,
        request: &ApplyReviewRequest,
    ) -> GradingResult<Attempt> {
        let mut attempt = uow
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| GradingError::not_found("attempt", attempt_id))?;

        if attempt.status != AttemptStatus::PendingReview {
            return Err(GradingError::conflict(format!(
                "attempt {} is {} and cannot be reviewed",
                attempt.id, attempt.status
            )));
        }

        for correction in &request.corrections {
            let answer_id = correction.answer_id.trim();
            let mut answer = uow
                .answer(answer_id)
                .await?
                .filter(|a| a.attempt_id == attempt.id)
                .ok_or_else(|| GradingError::not_found("answer", answer_id))?;

            answer.score = Some(round2(correction.score));
            answer.instructor_feedback = correction.feedback.clone();
            uow.update_answer(&answer).await?;
        }

        let weights: HashMap<&str, f64> =
            questions.iter().map(|q| (q.id.as_str(), q.weight)).collect();
        let answers = uow.answers(&attempt.id).await?;
        let entries = answers.iter().filter_map(|answer| {
            match weights.get(answer.question_id.as_str()) {
                Some(weight) => Some((*weight, answer.score)),
                None => {
                    warn!(
                        "Answer {} references question {} no longer in assessment {}, ignoring",
                        answer.id, answer.question_id, assessment.code
                    );
                    None
                }
            }
        });

        let score = round2(weighted_score(entries));
        attempt.score = Some(score);
        attempt.status = verdict(score, assessment.pass_threshold());
        attempt.finished_at.get_or_insert(self.now());
        uow.update_attempt(&attempt).await?;

        Ok(attempt)
    }

    /// Logs a committed transition. Terminal statuses are counted and
    /// PASSED/FAILED verdicts go to outcome propagation.
    fn record_transition(&self, assessment: &Assessment, attempt: &Attempt) {
        if attempt.status.is_terminal() {
            ATTEMPTS_FINALIZED_TOTAL
                .with_label_values(&[attempt.status.as_str()])
                .inc();
        }
        info!(
            attempt_id = %attempt.id,
            learner_id = %attempt.learner_id,
            status = %attempt.status,
            score = ?attempt.score,
            "Attempt on {} moved to {}",
            assessment.code,
            attempt.status
        );

        if matches!(attempt.status, AttemptStatus::Passed | AttemptStatus::Failed) {
            self.outcomes.dispatch(OutcomeNotice {
                attempt_id: attempt.id.clone(),
                assessment_code: assessment.code.clone(),
                course_id: assessment.course_id.clone(),
                module_id: assessment.module_id.clone(),
                learner_id: attempt.learner_id.clone(),
                score: attempt.score.unwrap_or(0.0),
                passed: attempt.status == AttemptStatus::Passed,
            });
        }
    }
}

fn start_response(
    assessment: &Assessment,
    questions: &[Question],
    attempt: &Attempt,
    history: &[Attempt],
    resumed: bool,
) -> StartAttemptResponse {
    let previous_attempts = history
        .iter()
        .filter(|a| a.id != attempt.id && a.status.is_finalized())
        .count() as u32;

    StartAttemptResponse {
        attempt: attempt.view(assessment.time_limit()),
        assessment: assessment.summary(),
        questions: questions.iter().map(Question::for_learner).collect(),
        previous_attempts,
        resumed,
    }
}

fn deny_log(assessment_code: &str, learner_id: &str, reason: &GatingReason) {
    GATING_DENIED_TOTAL.with_label_values(&[reason.code()]).inc();
    warn!(
        learner_id = %learner_id,
        reason = reason.code(),
        "Start of {} refused: {}",
        assessment_code,
        reason
    );
}

async fn rollback(mut uow: Box<dyn UnitOfWork>) {
    if let Err(err) = uow.rollback().await {
        warn!(error = %err, "Rollback failed");
    }
}

async fn commit_or_rollback<T>(
    mut uow: Box<dyn UnitOfWork>,
    result: GradingResult<T>,
) -> GradingResult<T> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            rollback(uow).await;
            Err(err)
        }
    }
}
