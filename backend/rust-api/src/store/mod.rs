//! Attempt and Answer stores.
//!
//! Every state-changing engine operation runs inside a [`UnitOfWork`] obtained
//! from an [`AttemptStore`]. A unit of work is serialized on a key (one attempt,
//! or one assessment/learner pair) and its writes become visible together on
//! [`UnitOfWork::commit`]. Dropping it uncommitted discards every write.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Answer, Attempt, NewAnswer};

pub mod lock;
pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("could not acquire lock {0}")]
    Lock(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if mongo::is_duplicate_key(&err) {
            StoreError::Duplicate(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Lock(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage handle injected into the engine.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Opens a unit of work serialized on a single attempt.
    async fn begin_attempt(&self, attempt_id: &str) -> StoreResult<Box<dyn UnitOfWork>>;

    /// Opens a unit of work serialized on an (assessment, learner) pair.
    async fn begin_learner(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Box<dyn UnitOfWork>>;

    async fn find_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>>;

    /// Attempts for one learner on one assessment, oldest first.
    async fn attempts_for(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>>;

    /// Every attempt of a learner, newest first.
    async fn learner_history(&self, learner_id: &str) -> StoreResult<Vec<Attempt>>;

    /// PENDING_REVIEW attempts, oldest first.
    async fn pending_review(&self, limit: u32, offset: u32) -> StoreResult<Vec<Attempt>>;

    async fn answers(&self, attempt_id: &str) -> StoreResult<Vec<Answer>>;

    /// Readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Scoped transaction over the Attempt and Answer stores.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn attempt(&mut self, attempt_id: &str) -> StoreResult<Option<Attempt>>;

    async fn attempts_for(
        &mut self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>>;

    /// Fails with [`StoreError::Duplicate`] when the learner already has an
    /// IN_PROGRESS attempt on the same assessment.
    async fn insert_attempt(&mut self, attempt: &Attempt) -> StoreResult<()>;

    async fn update_attempt(&mut self, attempt: &Attempt) -> StoreResult<()>;

    /// Insert-or-replace keyed on (attempt_id, question_id). Replacing keeps the
    /// stored id and creation time and clears instructor feedback.
    async fn upsert_answer(&mut self, answer: NewAnswer) -> StoreResult<Answer>;

    async fn answer(&mut self, answer_id: &str) -> StoreResult<Option<Answer>>;

    async fn answers(&mut self, attempt_id: &str) -> StoreResult<Vec<Answer>>;

    async fn update_answer(&mut self, answer: &Answer) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
