use serde::{Deserialize, Serialize};

/// Learner enrollment as reported by the progress tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub learner_id: String,
    pub course_id: String,
    pub status: EnrollmentStatus,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub modules: Vec<ModuleProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub module_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub completed: bool,
}

impl Enrollment {
    pub fn module(&self, module_id: &str) -> Option<&ModuleProgress> {
        self.modules.iter().find(|m| m.module_id == module_id)
    }

    /// Mandatory modules other than `exclude_module` that are not yet complete.
    pub fn incomplete_prerequisites(&self, exclude_module: Option<&str>) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.mandatory && !m.completed)
            .filter(|m| Some(m.module_id.as_str()) != exclude_module)
            .map(|m| m.title.clone().unwrap_or_else(|| m.module_id.clone()))
            .collect()
    }

    /// Marks `module_id` complete. Returns false when it was already complete
    /// or is not part of the enrollment.
    pub fn complete_module(&mut self, module_id: &str) -> bool {
        match self.modules.iter_mut().find(|m| m.module_id == module_id) {
            Some(module) if !module.completed => {
                module.completed = true;
                true
            }
            _ => false,
        }
    }

    /// Share of completed mandatory modules, or of all modules when the course
    /// has no mandatory ones. An enrollment without modules reports 0.
    pub fn completion_percent(&self) -> u8 {
        let has_mandatory = self.modules.iter().any(|m| m.mandatory);
        let counted: Vec<&ModuleProgress> = self
            .modules
            .iter()
            .filter(|m| m.mandatory || !has_mandatory)
            .collect();
        if counted.is_empty() {
            return 0;
        }

        let done = counted.iter().filter(|m| m.completed).count();
        let percent = (done as f64 / counted.len() as f64 * 100.0).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

impl EnrollmentStatus {
    pub fn for_percent(percent: u8) -> Self {
        if percent >= 100 {
            EnrollmentStatus::Complete
        } else {
            EnrollmentStatus::InProgress
        }
    }
}
