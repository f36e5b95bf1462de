#![allow(dead_code)]

use assessment_engine::{
    config::{Config, EventsConfig, ProgressConfig},
    create_router,
    models::{
        Assessment, Enrollment, EnrollmentStatus, ModuleProgress, OutcomeNotice, Question,
        QuestionKind,
    },
    services::{
        catalog::InMemoryCatalog,
        event_publisher::{EventPublisher, PublishError},
        progress_client::{ProgressClient, ProgressError},
        AppState, Collaborators,
    },
    store::MemoryStore,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const COURSE: &str = "course-1";
pub const MODULE: &str = "module-quiz";

pub fn test_config() -> Config {
    Config {
        mongo_uri: "mongodb://unused".to_string(),
        redis_uri: "redis://unused".to_string(),
        mongo_database: "assessments-test".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        progress: ProgressConfig {
            url: "http://progress.invalid".to_string(),
            timeout_ms: 200,
        },
        events: EventsConfig {
            stream_prefix: "test-events".to_string(),
            max_len: 1000,
        },
        lock_ttl_ms: 1000,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressMode {
    Up,
    Down,
    Slow,
}

/// Progress tracker fake holding enrollments keyed by (learner, course).
pub struct ScriptedProgress {
    enrollments: Mutex<HashMap<(String, String), Enrollment>>,
    mode: Mutex<ProgressMode>,
    pub completed_modules: Mutex<Vec<(String, String)>>,
}

impl ScriptedProgress {
    fn new() -> Self {
        Self {
            enrollments: Mutex::new(HashMap::new()),
            mode: Mutex::new(ProgressMode::Up),
            completed_modules: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: ProgressMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn enroll(&self, learner_id: &str, modules: Vec<ModuleProgress>) {
        let enrollment = Enrollment {
            id: format!("enr-{}", learner_id),
            learner_id: learner_id.to_string(),
            course_id: COURSE.to_string(),
            status: EnrollmentStatus::InProgress,
            progress_percent: 0,
            modules,
        };
        self.enrollments
            .lock()
            .unwrap()
            .insert((learner_id.to_string(), COURSE.to_string()), enrollment);
    }

    pub fn enrollment_of(&self, learner_id: &str) -> Option<Enrollment> {
        self.enrollments
            .lock()
            .unwrap()
            .get(&(learner_id.to_string(), COURSE.to_string()))
            .cloned()
    }

    fn check_mode(&self) -> Result<(), ProgressError> {
        if *self.mode.lock().unwrap() == ProgressMode::Down {
            return Err(ProgressError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn with_enrollment<F>(&self, enrollment_id: &str, f: F) -> Result<(), ProgressError>
    where
        F: FnOnce(&mut Enrollment),
    {
        let mut enrollments = self.enrollments.lock().unwrap();
        let enrollment = enrollments
            .values_mut()
            .find(|e| e.id == enrollment_id)
            .ok_or_else(|| ProgressError::Rejected {
                status: 404,
                body: "unknown enrollment".to_string(),
            })?;
        f(enrollment);
        Ok(())
    }
}

#[async_trait]
impl ProgressClient for ScriptedProgress {
    async fn enrollment(
        &self,
        learner_id: &str,
        course_id: &str,
    ) -> Result<Option<Enrollment>, ProgressError> {
        let mode = *self.mode.lock().unwrap();
        if mode == ProgressMode::Slow {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        self.check_mode()?;
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .get(&(learner_id.to_string(), course_id.to_string()))
            .cloned())
    }

    async fn mark_module_complete(
        &self,
        enrollment_id: &str,
        module_id: &str,
    ) -> Result<(), ProgressError> {
        self.check_mode()?;
        self.with_enrollment(enrollment_id, |e| {
            e.complete_module(module_id);
        })?;
        self.completed_modules
            .lock()
            .unwrap()
            .push((enrollment_id.to_string(), module_id.to_string()));
        Ok(())
    }

    async fn update_enrollment(
        &self,
        enrollment_id: &str,
        progress_percent: u8,
        status: EnrollmentStatus,
    ) -> Result<(), ProgressError> {
        self.check_mode()?;
        self.with_enrollment(enrollment_id, |e| {
            e.progress_percent = progress_percent;
            e.status = status;
        })
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub fail: AtomicBool,
    attempts: Mutex<Vec<OutcomeNotice>>,
    delivered: Mutex<Vec<OutcomeNotice>>,
}

impl RecordingPublisher {
    pub fn delivered(&self) -> Vec<OutcomeNotice> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<OutcomeNotice> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, notice: &OutcomeNotice) -> Result<(), PublishError> {
        self.attempts.lock().unwrap().push(notice.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Channel("stream unavailable".to_string()));
        }
        self.delivered.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Wall clock shifted by a controllable offset.
#[derive(Clone, Default)]
pub struct TestClock {
    offset_secs: Arc<AtomicI64>,
}

impl TestClock {
    pub fn advance_minutes(&self, minutes: i64) {
        self.offset_secs.fetch_add(minutes * 60, Ordering::SeqCst);
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.offset_secs.load(Ordering::SeqCst))
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: MemoryStore,
    pub catalog: Arc<InMemoryCatalog>,
    pub progress: Arc<ScriptedProgress>,
    pub publisher: Arc<RecordingPublisher>,
    pub clock: TestClock,
}

impl TestApp {
    pub async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let store = MemoryStore::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        let progress = Arc::new(ScriptedProgress::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = TestClock::default();

        let clock_source = clock.clone();
        let collaborators = Collaborators {
            store: Arc::new(store.clone()),
            catalog: catalog.clone(),
            progress: progress.clone(),
            publisher: publisher.clone(),
            clock: Arc::new(move || clock_source.now()),
        };
        let state = Arc::new(AppState::with_collaborators(
            test_config(),
            collaborators,
            None,
        ));

        Self {
            router: create_router(state.clone()),
            state,
            store,
            catalog,
            progress,
            publisher,
            clock,
        }
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_string(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn start(&self, code: &str, learner_id: &str) -> (StatusCode, Value) {
        self.request(
            "POST",
            &format!("/api/v1/assessments/{}/attempts", code),
            Some(serde_json::json!({ "learner_id": learner_id })),
        )
        .await
    }

    pub async fn submit(&self, attempt_id: &str, answers: Value) -> (StatusCode, Value) {
        self.request(
            "POST",
            &format!("/api/v1/attempts/{}/submit", attempt_id),
            Some(serde_json::json!({ "answers": answers })),
        )
        .await
    }

    pub async fn review(&self, attempt_id: &str, corrections: Value) -> (StatusCode, Value) {
        self.request(
            "POST",
            &format!("/api/v1/attempts/{}/review", attempt_id),
            Some(serde_json::json!({ "corrections": corrections })),
        )
        .await
    }

    pub async fn free_text(&self, attempt_id: &str) -> (StatusCode, Value) {
        self.request(
            "GET",
            &format!("/api/v1/attempts/{}/free-text", attempt_id),
            None,
        )
        .await
    }

    /// Starts an attempt that must be newly created and returns its id.
    pub async fn start_new(&self, code: &str, learner_id: &str) -> String {
        let (status, body) = self.start(code, learner_id).await;
        assert_eq!(status, StatusCode::CREATED, "unexpected start response: {}", body);
        body["attempt"]["id"].as_str().unwrap().to_string()
    }

    /// Waits until the outcome worker has attempted `count` publishes.
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<OutcomeNotice> {
        for _ in 0..200 {
            let attempts = self.publisher.attempts();
            if attempts.len() >= count {
                return attempts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} publishes, saw {}",
            count,
            self.publisher.attempts().len()
        );
    }
}

fn question(
    id: &str,
    code: &str,
    kind: QuestionKind,
    weight: f64,
    key: Option<&str>,
    position: i32,
) -> Question {
    Question {
        id: id.to_string(),
        assessment_code: code.to_string(),
        kind,
        prompt: format!("Prompt for {}", id),
        weight,
        correct_answer: key.map(str::to_string),
        options: match kind {
            QuestionKind::TrueFalse => vec!["V".to_string(), "F".to_string()],
            QuestionKind::MultipleChoice => vec!["A".to_string(), "B".to_string(), "C".to_string()],
            QuestionKind::FreeText => vec![],
        },
        position,
    }
}

pub fn assessment(code: &str) -> Assessment {
    Assessment {
        code: code.to_string(),
        title: format!("Assessment {}", code),
        pass_threshold: Some(70.0),
        attempts_allowed: Some(1),
        time_limit_minutes: None,
        module_id: None,
        course_id: None,
        active: true,
    }
}

/// TRUE_FALSE `tf` (key "V") plus FREE_TEXT `essay`, both weight 1.
pub fn seed_mixed(app: &TestApp, assessment: Assessment) {
    let code = assessment.code.clone();
    app.catalog.insert(
        assessment,
        vec![
            question("tf", &code, QuestionKind::TrueFalse, 1.0, Some("V"), 1),
            question("essay", &code, QuestionKind::FreeText, 1.0, None, 2),
        ],
    );
}

/// TRUE_FALSE `tf` (key "V", weight 1) plus MULTIPLE_CHOICE `mc` (key "B", weight 3).
pub fn seed_objective(app: &TestApp, assessment: Assessment) {
    let code = assessment.code.clone();
    app.catalog.insert(
        assessment,
        vec![
            question("tf", &code, QuestionKind::TrueFalse, 1.0, Some("V"), 1),
            question("mc", &code, QuestionKind::MultipleChoice, 3.0, Some("B"), 2),
        ],
    );
}

pub fn module(id: &str, mandatory: bool, completed: bool) -> ModuleProgress {
    ModuleProgress {
        module_id: id.to_string(),
        title: Some(format!("Module {}", id)),
        mandatory,
        completed,
    }
}
