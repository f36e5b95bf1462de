use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{GatingReason, GradingError};
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1", api_routes())
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/assessments/{code}/attempts",
            post(handlers::attempts::start_attempt),
        )
        .route("/attempts/{id}", get(handlers::attempts::get_attempt))
        .route(
            "/attempts/{id}/submit",
            post(handlers::attempts::submit_attempt),
        )
        .route(
            "/attempts/{id}/statistics",
            get(handlers::attempts::attempt_statistics),
        )
        .route(
            "/attempts/{id}/free-text",
            get(handlers::reviews::list_free_text),
        )
        .route("/attempts/{id}/review", post(handlers::reviews::apply_review))
        .route("/reviews/pending", get(handlers::reviews::pending_reviews))
        .route(
            "/learners/{id}/attempts",
            get(handlers::attempts::learner_history),
        )
}
