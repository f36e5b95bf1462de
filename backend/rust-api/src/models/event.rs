use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TOPIC_ASSESSMENT_PASSED: &str = "assessment.passed";
pub const TOPIC_ASSESSMENT_FAILED: &str = "assessment.failed";

/// Terminal grading verdict handed to outcome propagation after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeNotice {
    pub attempt_id: String,
    pub assessment_code: String,
    pub course_id: Option<String>,
    pub module_id: Option<String>,
    pub learner_id: String,
    pub score: f64,
    pub passed: bool,
}

impl OutcomeNotice {
    pub fn topic(&self) -> &'static str {
        if self.passed {
            TOPIC_ASSESSMENT_PASSED
        } else {
            TOPIC_ASSESSMENT_FAILED
        }
    }
}

/// Payload published on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentEvent {
    pub assessment_code: String,
    pub course_id: Option<String>,
    pub learner_id: String,
    pub attempt_id: String,
    pub score: f64,
    pub passed: bool,
}

impl From<&OutcomeNotice> for AssessmentEvent {
    fn from(notice: &OutcomeNotice) -> Self {
        Self {
            assessment_code: notice.assessment_code.clone(),
            course_id: notice.course_id.clone(),
            learner_id: notice.learner_id.clone(),
            attempt_id: notice.attempt_id.clone(),
            score: notice.score,
            passed: notice.passed,
        }
    }
}

/// Envelope written to the durable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(event_type: &str, payload: T) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            version: 1,
            occurred_at: Utc::now(),
            payload,
        }
    }
}
