use serde::{Deserialize, Serialize};

pub const DEFAULT_PASS_THRESHOLD: f64 = 70.0;
pub const DEFAULT_ATTEMPTS_ALLOWED: u32 = 1;
pub const DEFAULT_QUESTION_WEIGHT: f64 = 1.0;

/// Assessment definition as stored in the catalog "assessments" collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(rename = "_id")]
    pub code: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub pass_threshold: Option<f64>,

    #[serde(default)]
    pub attempts_allowed: Option<u32>,

    #[serde(default)]
    pub time_limit_minutes: Option<u32>,

    #[serde(default)]
    pub module_id: Option<String>,

    #[serde(default)]
    pub course_id: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Assessment {
    pub fn pass_threshold(&self) -> f64 {
        self.pass_threshold.unwrap_or(DEFAULT_PASS_THRESHOLD)
    }

    pub fn attempts_allowed(&self) -> u32 {
        self.attempts_allowed.unwrap_or(DEFAULT_ATTEMPTS_ALLOWED).max(1)
    }

    pub fn time_limit(&self) -> Option<chrono::Duration> {
        self.time_limit_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| chrono::Duration::minutes(i64::from(minutes)))
    }

    pub fn summary(&self) -> AssessmentSummary {
        AssessmentSummary {
            code: self.code.clone(),
            title: self.title.clone(),
            pass_threshold: self.pass_threshold(),
            attempts_allowed: self.attempts_allowed(),
            time_limit_minutes: self.time_limit_minutes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    FreeText,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionKind::TrueFalse => "TRUE_FALSE",
            QuestionKind::FreeText => "FREE_TEXT",
        }
    }

    /// Objective questions are graded by exact match against the answer key.
    pub fn is_objective(&self) -> bool {
        !matches!(self, QuestionKind::FreeText)
    }
}

/// Question as stored in the catalog "questions" collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,

    pub assessment_code: String,

    pub kind: QuestionKind,

    #[serde(default)]
    pub prompt: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub correct_answer: Option<String>,

    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default)]
    pub position: i32,
}

fn default_weight() -> f64 {
    DEFAULT_QUESTION_WEIGHT
}

impl Question {
    /// Enforces catalog invariants on a loaded question: weight is positive and
    /// free-text questions never carry an answer key.
    pub fn normalized(mut self) -> Self {
        if !(self.weight.is_finite() && self.weight > 0.0) {
            tracing::warn!(
                "Question {} has invalid weight {}, using {}",
                self.id,
                self.weight,
                DEFAULT_QUESTION_WEIGHT
            );
            self.weight = DEFAULT_QUESTION_WEIGHT;
        }
        if self.kind == QuestionKind::FreeText && self.correct_answer.is_some() {
            tracing::warn!("Free-text question {} carries an answer key, ignoring it", self.id);
            self.correct_answer = None;
        }
        self
    }

    pub fn for_learner(&self) -> LearnerQuestion {
        LearnerQuestion {
            id: self.id.clone(),
            kind: self.kind,
            prompt: self.prompt.clone(),
            options: self.options.clone(),
            weight: self.weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentSummary {
    pub code: String,
    pub title: String,
    pub pass_threshold: f64,
    pub attempts_allowed: u32,
    pub time_limit_minutes: Option<u32>,
}

/// Question as shown to a learner; never includes the answer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerQuestion {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<String>,
    pub weight: f64,
}
