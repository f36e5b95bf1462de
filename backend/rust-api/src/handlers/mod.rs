use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::sync::Arc;

use crate::error::{GatingReason, GradingError};
use crate::metrics;
use crate::services::AppState;

pub mod attempts;
pub mod reviews;

impl IntoResponse for GradingError {
    fn into_response(self) -> Response {
        let status = match &self {
            GradingError::Validation(_) => StatusCode::BAD_REQUEST,
            GradingError::NotFound { .. } => StatusCode::NOT_FOUND,
            GradingError::Conflict(_) => StatusCode::CONFLICT,
            GradingError::GatingDenied(GatingReason::ProgressUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GradingError::GatingDenied(_) => StatusCode::FORBIDDEN,
            GradingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::Map::new();
        body.insert("error".to_string(), json!(self.code()));

        match &self {
            GradingError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                body.insert("message".to_string(), json!("Internal server error"));
            }
            GradingError::NotFound { entity, id } => {
                body.insert("message".to_string(), json!(self.to_string()));
                body.insert("entity".to_string(), json!(entity));
                body.insert("id".to_string(), json!(id));
            }
            GradingError::GatingDenied(reason) => {
                body.insert("message".to_string(), json!(reason.to_string()));
                if let Ok(serde_json::Value::Object(details)) = serde_json::to_value(reason) {
                    body.extend(details);
                }
            }
            _ => {
                body.insert("message".to_string(), json!(self.to_string()));
            }
        }

        (status, Json(serde_json::Value::Object(body))).into_response()
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = serde_json::Map::new();

    let store_health = check_store(&state).await;
    let mut all_healthy = store_health.get("status").and_then(|v| v.as_str()) == Some("healthy");
    dependencies.insert("store".to_string(), json!(store_health));

    if let Some(redis) = &state.redis {
        let redis_health = check_redis(redis).await;
        if redis_health.get("status").and_then(|v| v.as_str()) != Some("healthy") {
            all_healthy = false;
        }
        dependencies.insert("redis".to_string(), json!(redis_health));
    }

    let (status_code, status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "assessment-engine-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

async fn check_store(state: &AppState) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();

    match tokio::time::timeout(std::time::Duration::from_secs(1), state.store.ping()).await {
        Ok(Ok(())) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(e.to_string()));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("store ping timeout after 1s"));
        }
    }

    result
}

async fn check_redis(
    redis: &redis::aio::ConnectionManager,
) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();

    let mut conn = redis.clone();
    match tokio::time::timeout(
        std::time::Duration::from_millis(500),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    {
        Ok(Ok(_)) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("Redis error: {}", e)));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("Redis timeout after 500ms"));
        }
    }

    result
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// HTTP Basic auth for `/metrics` against `METRICS_AUTH` (`user:password`).
/// Refuses everything when `METRICS_AUTH` is unset.
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = std::env::var("METRICS_AUTH").map_err(|_| {
        tracing::warn!("METRICS_AUTH is not set, refusing /metrics");
        StatusCode::UNAUTHORIZED
    })?;

    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
