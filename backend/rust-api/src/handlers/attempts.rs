use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::error::GradingError;
use crate::extractors::{AppJson, AppQuery};
use crate::models::{
    Attempt, AttemptStatistics, AttemptView, LearnerHistoryQuery, StartAttemptRequest,
    StartAttemptResponse, SubmitAttemptRequest, SubmitAttemptResponse,
};
use crate::services::AppState;

/// POST /api/v1/assessments/{code}/attempts
///
/// 201 for a new attempt, 200 when an attempt already in progress is returned.
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    AppJson(payload): AppJson<StartAttemptRequest>,
) -> Result<(StatusCode, Json<StartAttemptResponse>), GradingError> {
    let response = state.attempts.start_attempt(&code, payload).await?;
    let status = if response.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

/// GET /api/v1/attempts/{id}
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptView>, GradingError> {
    Ok(Json(state.attempts.get_attempt(&attempt_id).await?))
}

/// POST /api/v1/attempts/{id}/submit
pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(payload): AppJson<SubmitAttemptRequest>,
) -> Result<Json<SubmitAttemptResponse>, GradingError> {
    Ok(Json(state.attempts.submit(&attempt_id, payload).await?))
}

/// GET /api/v1/attempts/{id}/statistics
pub async fn attempt_statistics(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptStatistics>, GradingError> {
    Ok(Json(state.reviews.statistics(&attempt_id).await?))
}

/// GET /api/v1/learners/{id}/attempts
pub async fn learner_history(
    State(state): State<Arc<AppState>>,
    Path(learner_id): Path<String>,
    AppQuery(query): AppQuery<LearnerHistoryQuery>,
) -> Result<Json<Vec<Attempt>>, GradingError> {
    let attempts = state
        .attempts
        .learner_history(&learner_id, query.assessment_code.as_deref())
        .await?;
    Ok(Json(attempts))
}
