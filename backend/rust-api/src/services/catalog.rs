use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{bson::doc, Collection, Database};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::metrics::track_db_operation;
use crate::models::{Assessment, Question};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog backend error: {0}")]
    Backend(String),
}

impl From<mongodb::error::Error> for CatalogError {
    fn from(err: mongodb::error::Error) -> Self {
        CatalogError::Backend(err.to_string())
    }
}

/// Read-only view of assessment definitions and their question banks.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn assessment(&self, code: &str) -> Result<Option<Assessment>, CatalogError>;

    /// Questions of an assessment in presentation order, normalized.
    async fn questions(&self, code: &str) -> Result<Vec<Question>, CatalogError>;
}

pub struct MongoCatalog {
    assessments: Collection<Assessment>,
    questions: Collection<Question>,
}

impl MongoCatalog {
    pub fn new(db: &Database) -> Self {
        Self {
            assessments: db.collection("assessments"),
            questions: db.collection("questions"),
        }
    }
}

#[async_trait]
impl Catalog for MongoCatalog {
    async fn assessment(&self, code: &str) -> Result<Option<Assessment>, CatalogError> {
        track_db_operation("find_one", "assessments", async {
            Ok(self.assessments.find_one(doc! { "_id": code }).await?)
        })
        .await
    }

    async fn questions(&self, code: &str) -> Result<Vec<Question>, CatalogError> {
        track_db_operation("find", "questions", async {
            let cursor = self
                .questions
                .find(doc! { "assessment_code": code })
                .sort(doc! { "position": 1, "_id": 1 })
                .await?;
            let questions: Vec<Question> = cursor.try_collect().await?;
            Ok(questions.into_iter().map(Question::normalized).collect())
        })
        .await
    }
}

/// Catalog held in memory; used by tests and local tooling.
#[derive(Default)]
pub struct InMemoryCatalog {
    assessments: RwLock<HashMap<String, Assessment>>,
    questions: RwLock<HashMap<String, Vec<Question>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an assessment with its question bank.
    pub fn insert(&self, assessment: Assessment, questions: Vec<Question>) {
        let code = assessment.code.clone();
        if let Ok(mut assessments) = self.assessments.write() {
            assessments.insert(code.clone(), assessment);
        }
        if let Ok(mut bank) = self.questions.write() {
            bank.insert(code, questions);
        }
    }
}

fn poisoned() -> CatalogError {
    CatalogError::Backend("in-memory catalog lock poisoned".to_string())
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn assessment(&self, code: &str) -> Result<Option<Assessment>, CatalogError> {
        let assessments = self.assessments.read().map_err(|_| poisoned())?;
        Ok(assessments.get(code).cloned())
    }

    async fn questions(&self, code: &str) -> Result<Vec<Question>, CatalogError> {
        let bank = self.questions.read().map_err(|_| poisoned())?;
        let mut questions: Vec<Question> = bank
            .get(code)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(Question::normalized)
            .collect();
        questions.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(questions)
    }
}
