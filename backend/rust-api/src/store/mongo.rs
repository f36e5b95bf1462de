use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOptions, IndexOptions, ReturnDocument},
    ClientSession, Collection, Database, IndexModel,
};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::lock::{LockGuard, RedisLock};
use super::{AttemptStore, StoreError, StoreResult, UnitOfWork};
use crate::metrics::track_db_operation;
use crate::models::{Answer, Attempt, AttemptStatus, NewAnswer};
use crate::utils::time::{bson_datetime_as_chrono, bson_datetime_as_chrono_option};

const ATTEMPTS: &str = "attempts";
const ANSWERS: &str = "answers";

pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::Command(ce) => ce.code == 11000,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id")]
    id: String,
    assessment_code: String,
    learner_id: String,
    #[serde(with = "bson_datetime_as_chrono")]
    started_at: DateTime<Utc>,
    #[serde(default, with = "bson_datetime_as_chrono_option")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    score: Option<f64>,
    status: AttemptStatus,
}

impl From<&Attempt> for AttemptDocument {
    fn from(a: &Attempt) -> Self {
        Self {
            id: a.id.clone(),
            assessment_code: a.assessment_code.clone(),
            learner_id: a.learner_id.clone(),
            started_at: a.started_at,
            finished_at: a.finished_at,
            score: a.score,
            status: a.status,
        }
    }
}

impl From<AttemptDocument> for Attempt {
    fn from(d: AttemptDocument) -> Self {
        Self {
            id: d.id,
            assessment_code: d.assessment_code,
            learner_id: d.learner_id,
            started_at: d.started_at,
            finished_at: d.finished_at,
            score: d.score,
            status: d.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerDocument {
    #[serde(rename = "_id")]
    id: String,
    attempt_id: String,
    question_id: String,
    #[serde(default)]
    learner_response: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    instructor_feedback: Option<String>,
    #[serde(with = "bson_datetime_as_chrono")]
    created_at: DateTime<Utc>,
}

impl From<&Answer> for AnswerDocument {
    fn from(a: &Answer) -> Self {
        Self {
            id: a.id.clone(),
            attempt_id: a.attempt_id.clone(),
            question_id: a.question_id.clone(),
            learner_response: a.learner_response.clone(),
            score: a.score,
            instructor_feedback: a.instructor_feedback.clone(),
            created_at: a.created_at,
        }
    }
}

impl From<AnswerDocument> for Answer {
    fn from(d: AnswerDocument) -> Self {
        Self {
            id: d.id,
            attempt_id: d.attempt_id,
            question_id: d.question_id,
            learner_response: d.learner_response,
            score: d.score,
            instructor_feedback: d.instructor_feedback,
            created_at: d.created_at,
        }
    }
}

/// MongoDB-backed store. Units of work run in a multi-document transaction
/// and are serialized through a Redis lock, so the deployment must be a
/// replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: mongodb::Client,
    db: Database,
    lock: RedisLock,
}

impl MongoStore {
    pub fn new(
        client: mongodb::Client,
        database: &str,
        redis: ConnectionManager,
        lock_ttl: Duration,
    ) -> Self {
        let db = client.database(database);
        Self {
            client,
            db,
            lock: RedisLock::new(redis, lock_ttl),
        }
    }

    fn attempts(&self) -> Collection<AttemptDocument> {
        self.db.collection(ATTEMPTS)
    }

    fn answers_collection(&self) -> Collection<AnswerDocument> {
        self.db.collection(ANSWERS)
    }

    /// Creates the indexes the store relies on for uniqueness and lookups.
    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        let attempt_indexes = vec![
            IndexModel::builder()
                .keys(doc! { "assessment_code": 1, "learner_id": 1 })
                .options(
                    IndexOptions::builder()
                        .name("one_in_progress_per_learner".to_string())
                        .unique(true)
                        .partial_filter_expression(doc! { "status": "IN_PROGRESS" })
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "assessment_code": 1, "learner_id": 1, "started_at": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "learner_id": 1, "started_at": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "status": 1, "started_at": 1 })
                .build(),
        ];
        self.attempts().create_indexes(attempt_indexes).await?;

        let answer_index = IndexModel::builder()
            .keys(doc! { "attempt_id": 1, "question_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("one_answer_per_question".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.answers_collection().create_index(answer_index).await?;

        tracing::info!("Attempt store indexes ensured");
        Ok(())
    }

    async fn begin(&self, key: String) -> StoreResult<Box<dyn UnitOfWork>> {
        let guard = self.lock.acquire(&key).await?;

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        Ok(Box::new(MongoUnitOfWork {
            session,
            attempts: self.attempts(),
            answers: self.answers_collection(),
            guard: Some(guard),
        }))
    }

    async fn find_attempts(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> StoreResult<Vec<Attempt>> {
        track_db_operation("find", ATTEMPTS, async {
            let cursor = self.attempts().find(filter).with_options(options).await?;
            let docs: Vec<AttemptDocument> = cursor.try_collect().await?;
            Ok(docs.into_iter().map(Attempt::from).collect())
        })
        .await
    }
}

#[async_trait]
impl AttemptStore for MongoStore {
    async fn begin_attempt(&self, attempt_id: &str) -> StoreResult<Box<dyn UnitOfWork>> {
        self.begin(format!("attempt:{}", attempt_id)).await
    }

    async fn begin_learner(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Box<dyn UnitOfWork>> {
        self.begin(format!("learner:{}:{}", assessment_code, learner_id))
            .await
    }

    async fn find_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        track_db_operation("find_one", ATTEMPTS, async {
            let found = self.attempts().find_one(doc! { "_id": attempt_id }).await?;
            Ok(found.map(Attempt::from))
        })
        .await
    }

    async fn attempts_for(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>> {
        self.find_attempts(
            doc! { "assessment_code": assessment_code, "learner_id": learner_id },
            FindOptions::builder().sort(doc! { "started_at": 1 }).build(),
        )
        .await
    }

    async fn learner_history(&self, learner_id: &str) -> StoreResult<Vec<Attempt>> {
        self.find_attempts(
            doc! { "learner_id": learner_id },
            FindOptions::builder().sort(doc! { "started_at": -1 }).build(),
        )
        .await
    }

    async fn pending_review(&self, limit: u32, offset: u32) -> StoreResult<Vec<Attempt>> {
        self.find_attempts(
            doc! { "status": AttemptStatus::PendingReview.as_str() },
            FindOptions::builder()
                .sort(doc! { "started_at": 1 })
                .skip(u64::from(offset))
                .limit(i64::from(limit))
                .build(),
        )
        .await
    }

    async fn answers(&self, attempt_id: &str) -> StoreResult<Vec<Answer>> {
        track_db_operation("find", ANSWERS, async {
            let cursor = self
                .answers_collection()
                .find(doc! { "attempt_id": attempt_id })
                .sort(doc! { "created_at": 1, "question_id": 1 })
                .await?;
            let docs: Vec<AnswerDocument> = cursor.try_collect().await?;
            Ok(docs.into_iter().map(Answer::from).collect())
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

struct MongoUnitOfWork {
    session: ClientSession,
    attempts: Collection<AttemptDocument>,
    answers: Collection<AnswerDocument>,
    guard: Option<LockGuard>,
}

impl MongoUnitOfWork {
    async fn release_lock(&mut self) {
        if let Some(guard) = self.guard.take() {
            if let Err(e) = guard.release().await {
                tracing::warn!(error = %e, "Failed to release unit-of-work lock");
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for MongoUnitOfWork {
    async fn attempt(&mut self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        let found = self
            .attempts
            .find_one(doc! { "_id": attempt_id })
            .session(&mut self.session)
            .await?;
        Ok(found.map(Attempt::from))
    }

    async fn attempts_for(
        &mut self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>> {
        let mut cursor = self
            .attempts
            .find(doc! { "assessment_code": assessment_code, "learner_id": learner_id })
            .sort(doc! { "started_at": 1 })
            .session(&mut self.session)
            .await?;

        let mut attempts = Vec::new();
        while cursor.advance(&mut self.session).await? {
            let current = cursor
                .deserialize_current()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            attempts.push(Attempt::from(current));
        }
        Ok(attempts)
    }

    async fn insert_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        if attempt.status == AttemptStatus::InProgress {
            let open = self
                .attempts
                .find_one(doc! {
                    "assessment_code": &attempt.assessment_code,
                    "learner_id": &attempt.learner_id,
                    "status": AttemptStatus::InProgress.as_str(),
                })
                .session(&mut self.session)
                .await?;
            if open.is_some() {
                return Err(StoreError::Duplicate(format!(
                    "in-progress attempt for {}/{}",
                    attempt.assessment_code, attempt.learner_id
                )));
            }
        }

        self.attempts
            .insert_one(AttemptDocument::from(attempt))
            .session(&mut self.session)
            .await?;
        Ok(())
    }

    async fn update_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        let result = self
            .attempts
            .replace_one(doc! { "_id": &attempt.id }, AttemptDocument::from(attempt))
            .session(&mut self.session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Backend(format!(
                "attempt {} does not exist",
                attempt.id
            )));
        }
        Ok(())
    }

    async fn upsert_answer(&mut self, answer: NewAnswer) -> StoreResult<Answer> {
        let update = doc! {
            "$set": {
                "learner_response": answer.learner_response.clone(),
                "score": answer.score,
                "instructor_feedback": mongodb::bson::Bson::Null,
            },
            "$setOnInsert": {
                "_id": uuid::Uuid::new_v4().to_string(),
                "created_at": crate::utils::time::chrono_to_bson(Utc::now()),
            },
        };

        let stored = self
            .answers
            .find_one_and_update(
                doc! { "attempt_id": &answer.attempt_id, "question_id": &answer.question_id },
                update,
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .session(&mut self.session)
            .await?;

        stored.map(Answer::from).ok_or_else(|| {
            StoreError::Backend(format!(
                "upsert returned no answer for {}/{}",
                answer.attempt_id, answer.question_id
            ))
        })
    }

    async fn answer(&mut self, answer_id: &str) -> StoreResult<Option<Answer>> {
        let found = self
            .answers
            .find_one(doc! { "_id": answer_id })
            .session(&mut self.session)
            .await?;
        Ok(found.map(Answer::from))
    }

    async fn answers(&mut self, attempt_id: &str) -> StoreResult<Vec<Answer>> {
        let mut cursor = self
            .answers
            .find(doc! { "attempt_id": attempt_id })
            .sort(doc! { "created_at": 1, "question_id": 1 })
            .session(&mut self.session)
            .await?;

        let mut answers = Vec::new();
        while cursor.advance(&mut self.session).await? {
            let current = cursor
                .deserialize_current()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            answers.push(Answer::from(current));
        }
        Ok(answers)
    }

    async fn update_answer(&mut self, answer: &Answer) -> StoreResult<()> {
        let result = self
            .answers
            .replace_one(doc! { "_id": &answer.id }, AnswerDocument::from(answer))
            .session(&mut self.session)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Backend(format!(
                "answer {} does not exist",
                answer.id
            )));
        }
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let result = track_db_operation("commit", ATTEMPTS, async {
            self.session.commit_transaction().await?;
            Ok(())
        })
        .await;
        self.release_lock().await;
        result
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let result = self
            .session
            .abort_transaction()
            .await
            .map_err(StoreError::from);
        self.release_lock().await;
        result
    }
}
