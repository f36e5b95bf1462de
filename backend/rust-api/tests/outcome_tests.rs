mod common;

use assessment_engine::models::{Assessment, EnrollmentStatus};
use axum::http::StatusCode;
use common::{
    assessment, module, seed_mixed, seed_objective, ProgressMode, TestApp, COURSE, MODULE,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn course_quiz(code: &str) -> Assessment {
    let mut quiz = assessment(code);
    quiz.course_id = Some(COURSE.to_string());
    quiz.module_id = Some(MODULE.to_string());
    quiz
}

async fn submit_objective(app: &TestApp, attempt_id: &str, correct: bool) -> serde_json::Value {
    let (status, body) = app
        .submit(
            attempt_id,
            json!([
                { "question_id": "tf", "response": if correct { "V" } else { "F" } },
                { "question_id": "mc", "response": if correct { "B" } else { "A" } }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn passing_completes_the_module_and_publishes() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress.enroll(
        "learner-1",
        vec![module("intro", true, true), module(MODULE, true, false)],
    );
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    submit_objective(&app, &attempt_id, true).await;
    let notices = app.wait_for_publishes(1).await;
    // Progress sync trails the publish
    app.state.shutdown(Duration::from_secs(2)).await;

    assert_eq!(notices.len(), 1);
    let notice = &notices[0];
    assert_eq!(notice.attempt_id, attempt_id);
    assert!(notice.passed);
    assert_eq!(notice.score, 100.0);
    assert_eq!(notice.course_id.as_deref(), Some(COURSE));
    assert_eq!(notice.module_id.as_deref(), Some(MODULE));
    assert_eq!(notice.topic(), "assessment.passed");

    let completed = app.progress.completed_modules.lock().unwrap().clone();
    assert_eq!(
        completed,
        vec![("enr-learner-1".to_string(), MODULE.to_string())]
    );

    let enrollment = app.progress.enrollment_of("learner-1").unwrap();
    assert_eq!(enrollment.progress_percent, 100);
    assert_eq!(enrollment.status, EnrollmentStatus::Complete);
}

#[tokio::test]
async fn partial_course_progress_is_recomputed() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress.enroll(
        "learner-1",
        vec![module("intro", true, true), module(MODULE, true, false)],
    );
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    // A mandatory module added to the course after the attempt started
    app.progress.enroll(
        "learner-1",
        vec![
            module("intro", true, true),
            module(MODULE, true, false),
            module("capstone", true, false),
        ],
    );

    submit_objective(&app, &attempt_id, true).await;
    app.state.shutdown(Duration::from_secs(2)).await;

    let enrollment = app.progress.enrollment_of("learner-1").unwrap();
    assert_eq!(enrollment.progress_percent, 67);
    assert_eq!(enrollment.status, EnrollmentStatus::InProgress);
}

#[tokio::test]
async fn failing_publishes_without_touching_progress() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress
        .enroll("learner-1", vec![module(MODULE, true, false)]);
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    submit_objective(&app, &attempt_id, false).await;
    let notices = app.wait_for_publishes(1).await;

    assert!(!notices[0].passed);
    assert_eq!(notices[0].score, 0.0);
    assert_eq!(notices[0].topic(), "assessment.failed");
    assert!(app.progress.completed_modules.lock().unwrap().is_empty());
    let enrollment = app.progress.enrollment_of("learner-1").unwrap();
    assert!(!enrollment.modules[0].completed);
}

#[tokio::test]
async fn progress_outage_after_commit_keeps_the_verdict() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress
        .enroll("learner-1", vec![module(MODULE, true, false)]);
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    app.progress.set_mode(ProgressMode::Down);
    let body = submit_objective(&app, &attempt_id, true).await;
    assert_eq!(body["status"], "PASSED");

    app.state.shutdown(Duration::from_secs(2)).await;
    let notices = app.publisher.attempts();
    assert!(notices[0].passed);
    assert_eq!(app.publisher.delivered().len(), 1);
    assert!(app.progress.completed_modules.lock().unwrap().is_empty());

    let (_, attempt) = app
        .request("GET", &format!("/api/v1/attempts/{}", attempt_id), None)
        .await;
    assert_eq!(attempt["status"], "PASSED");
}

#[tokio::test]
async fn publish_failure_does_not_affect_the_response() {
    let app = TestApp::new().await;
    seed_objective(&app, assessment("QUIZ-1"));
    app.publisher.fail.store(true, Ordering::SeqCst);
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    let body = submit_objective(&app, &attempt_id, true).await;
    assert_eq!(body["status"], "PASSED");

    app.wait_for_publishes(1).await;
    assert!(app.publisher.delivered().is_empty());

    let (_, attempt) = app
        .request("GET", &format!("/api/v1/attempts/{}", attempt_id), None)
        .await;
    assert_eq!(attempt["status"], "PASSED");
}

#[tokio::test]
async fn review_publishes_only_the_final_verdict() {
    let app = TestApp::new().await;
    seed_mixed(&app, assessment("MIX-1"));
    let attempt_id = app.start_new("MIX-1", "learner-1").await;
    app.submit(
        &attempt_id,
        json!([
            { "question_id": "tf", "response": "V" },
            { "question_id": "essay", "response": "Traits." }
        ]),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app.publisher.attempts().is_empty());

    let (_, listing) = app.free_text(&attempt_id).await;
    let answer_id = listing["answers"][0]["answer_id"].as_str().unwrap().to_string();
    app.review(&attempt_id, json!([{ "answer_id": answer_id, "score": 50.0 }]))
        .await;

    let notices = app.wait_for_publishes(1).await;
    assert_eq!(notices.len(), 1);
    assert!(notices[0].passed);
    assert_eq!(notices[0].score, 75.0);
    assert!(notices[0].course_id.is_none());
}

#[tokio::test]
async fn notices_are_delivered_in_commit_order() {
    let app = TestApp::new().await;
    let mut quiz = assessment("QUIZ-1");
    quiz.attempts_allowed = Some(2);
    seed_objective(&app, quiz);

    let first = app.start_new("QUIZ-1", "learner-1").await;
    submit_objective(&app, &first, false).await;
    let second = app.start_new("QUIZ-1", "learner-1").await;
    submit_objective(&app, &second, true).await;

    let notices = app.wait_for_publishes(2).await;
    assert_eq!(notices[0].attempt_id, first);
    assert!(!notices[0].passed);
    assert_eq!(notices[1].attempt_id, second);
    assert!(notices[1].passed);
}

#[tokio::test]
async fn shutdown_still_delivers_a_fresh_verdict() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress
        .enroll("learner-1", vec![module(MODULE, true, false)]);
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    let body = submit_objective(&app, &attempt_id, true).await;
    assert_eq!(body["status"], "PASSED");
    app.state.shutdown(Duration::from_secs(2)).await;

    let delivered = app.publisher.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].attempt_id, attempt_id);
    assert_eq!(
        app.progress.completed_modules.lock().unwrap().clone(),
        vec![("enr-learner-1".to_string(), MODULE.to_string())]
    );

    // Safe to call twice
    app.state.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn slow_progress_tracker_does_not_hold_back_the_event() {
    let app = TestApp::new().await;
    seed_objective(&app, course_quiz("QUIZ-1"));
    app.progress
        .enroll("learner-1", vec![module(MODULE, true, false)]);
    let attempt_id = app.start_new("QUIZ-1", "learner-1").await;

    app.progress.set_mode(ProgressMode::Slow);
    submit_objective(&app, &attempt_id, true).await;

    let started = std::time::Instant::now();
    let notices = app.wait_for_publishes(1).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(notices[0].passed);
    assert!(app.progress.completed_modules.lock().unwrap().is_empty());

    app.state.shutdown(Duration::from_secs(5)).await;
    assert_eq!(app.progress.completed_modules.lock().unwrap().len(), 1);
}
