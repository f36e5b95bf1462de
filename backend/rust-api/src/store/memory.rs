use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

use super::{AttemptStore, StoreError, StoreResult, UnitOfWork};
use crate::models::{Answer, Attempt, AttemptStatus, NewAnswer};

#[derive(Debug, Default)]
struct MemoryState {
    attempts: BTreeMap<String, Attempt>,
    answers: BTreeMap<String, Answer>,
}

/// In-process store with the same isolation guarantees as [`super::MongoStore`]:
/// per-key async locks serialize units of work, and staged writes are applied
/// to shared state only on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail after staging, to exercise rollback paths.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        lock_state(&self.state)
    }

    async fn acquire(&self, key: String) -> StoreResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| StoreError::Lock(key.clone()))?;
            // Entries referenced only by the map have no holder or waiter left
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    async fn begin(&self, key: String) -> StoreResult<Box<dyn UnitOfWork>> {
        let guard = self.acquire(key).await?;
        Ok(Box::new(MemoryUnitOfWork {
            state: self.state.clone(),
            fail_next_commit: self.fail_next_commit.clone(),
            staged_attempts: BTreeMap::new(),
            staged_answers: BTreeMap::new(),
            _guard: guard,
        }))
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> StoreResult<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| StoreError::Backend("memory store state poisoned".to_string()))
}

fn sort_answers(answers: &mut [Answer]) {
    answers.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.question_id.cmp(&b.question_id))
    });
}

#[async_trait]
impl AttemptStore for MemoryStore {
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
        Ok(self.state()?.attempts.get(attempt_id).cloned())
    }

    async fn attempts_for(
        &self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .state()?
            .attempts
            .values()
            .filter(|a| a.assessment_code == assessment_code && a.learner_id == learner_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(attempts)
    }

    async fn learner_history(&self, learner_id: &str) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .state()?
            .attempts
            .values()
            .filter(|a| a.learner_id == learner_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(attempts)
    }

    async fn pending_review(&self, limit: u32, offset: u32) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .state()?
            .attempts
            .values()
            .filter(|a| a.status == AttemptStatus::PendingReview)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(attempts
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn answers(&self, attempt_id: &str) -> StoreResult<Vec<Answer>> {
        let mut answers: Vec<Answer> = self
            .state()?
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id)
            .cloned()
            .collect();
        sort_answers(&mut answers);
        Ok(answers)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.state().map(|_| ())
    }
}

struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
    staged_attempts: BTreeMap<String, Attempt>,
    staged_answers: BTreeMap<String, Answer>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryUnitOfWork {
    /// Committed attempts overlaid with this unit's staged writes.
    fn merged_attempts(&self) -> StoreResult<Vec<Attempt>> {
        let state = lock_state(&self.state)?;
        let mut merged = state.attempts.clone();
        for (id, attempt) in &self.staged_attempts {
            merged.insert(id.clone(), attempt.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn merged_answers(&self) -> StoreResult<Vec<Answer>> {
        let state = lock_state(&self.state)?;
        let mut merged = state.answers.clone();
        for (id, answer) in &self.staged_answers {
            merged.insert(id.clone(), answer.clone());
        }
        Ok(merged.into_values().collect())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn attempt(&mut self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        if let Some(staged) = self.staged_attempts.get(attempt_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(lock_state(&self.state)?.attempts.get(attempt_id).cloned())
    }

    async fn attempts_for(
        &mut self,
        assessment_code: &str,
        learner_id: &str,
    ) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .merged_attempts()?
            .into_iter()
            .filter(|a| a.assessment_code == assessment_code && a.learner_id == learner_id)
            .collect();
        attempts.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(attempts)
    }

    async fn insert_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        let merged = self.merged_attempts()?;
        if merged.iter().any(|a| a.id == attempt.id) {
            return Err(StoreError::Duplicate(format!("attempt {}", attempt.id)));
        }
        if attempt.status == AttemptStatus::InProgress
            && merged.iter().any(|a| {
                a.status == AttemptStatus::InProgress
                    && a.assessment_code == attempt.assessment_code
                    && a.learner_id == attempt.learner_id
            })
        {
            return Err(StoreError::Duplicate(format!(
                "in-progress attempt for {}/{}",
                attempt.assessment_code, attempt.learner_id
            )));
        }
        self.staged_attempts
            .insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn update_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        if self.attempt(&attempt.id).await?.is_none() {
            return Err(StoreError::Backend(format!(
                "attempt {} does not exist",
                attempt.id
            )));
        }
        self.staged_attempts
            .insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn upsert_answer(&mut self, answer: NewAnswer) -> StoreResult<Answer> {
        let existing = self
            .merged_answers()?
            .into_iter()
            .find(|a| a.attempt_id == answer.attempt_id && a.question_id == answer.question_id);

        let stored = match existing {
            Some(current) => Answer {
                learner_response: answer.learner_response,
                score: answer.score,
                instructor_feedback: None,
                ..current
            },
            None => Answer {
                id: uuid::Uuid::new_v4().to_string(),
                attempt_id: answer.attempt_id,
                question_id: answer.question_id,
                learner_response: answer.learner_response,
                score: answer.score,
                instructor_feedback: None,
                created_at: Utc::now(),
            },
        };

        self.staged_answers.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn answer(&mut self, answer_id: &str) -> StoreResult<Option<Answer>> {
        if let Some(staged) = self.staged_answers.get(answer_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(lock_state(&self.state)?.answers.get(answer_id).cloned())
    }

    async fn answers(&mut self, attempt_id: &str) -> StoreResult<Vec<Answer>> {
        let mut answers: Vec<Answer> = self
            .merged_answers()?
            .into_iter()
            .filter(|a| a.attempt_id == attempt_id)
            .collect();
        sort_answers(&mut answers);
        Ok(answers)
    }

    async fn update_answer(&mut self, answer: &Answer) -> StoreResult<()> {
        if self.answer(&answer.id).await?.is_none() {
            return Err(StoreError::Backend(format!(
                "answer {} does not exist",
                answer.id
            )));
        }
        self.staged_answers.insert(answer.id.clone(), answer.clone());
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.staged_attempts.clear();
            self.staged_answers.clear();
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }

        let mut state = lock_state(&self.state)?;
        for (id, attempt) in std::mem::take(&mut self.staged_attempts) {
            state.attempts.insert(id, attempt);
        }
        for (id, answer) in std::mem::take(&mut self.staged_answers) {
            state.answers.insert(id, answer);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.staged_attempts.clear();
        self.staged_answers.clear();
        Ok(())
    }
}
