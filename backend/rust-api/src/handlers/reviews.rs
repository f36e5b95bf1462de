use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::error::GradingError;
use crate::extractors::{AppJson, AppQuery};
use crate::models::{
    ApplyReviewRequest, ApplyReviewResponse, FreeTextAnswersResponse, PendingReviewEntry,
    PendingReviewQuery,
};
use crate::services::AppState;

/// GET /api/v1/attempts/{id}/free-text
pub async fn list_free_text(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<FreeTextAnswersResponse>, GradingError> {
    Ok(Json(state.reviews.list_pending_free_text(&attempt_id).await?))
}

/// POST /api/v1/attempts/{id}/review
pub async fn apply_review(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(payload): AppJson<ApplyReviewRequest>,
) -> Result<Json<ApplyReviewResponse>, GradingError> {
    Ok(Json(state.reviews.apply_review(&attempt_id, payload).await?))
}

/// GET /api/v1/reviews/pending?limit=&offset=
pub async fn pending_reviews(
    State(state): State<Arc<AppState>>,
    AppQuery(query): AppQuery<PendingReviewQuery>,
) -> Result<Json<Vec<PendingReviewEntry>>, GradingError> {
    Ok(Json(state.reviews.pending_reviews(query).await?))
}
