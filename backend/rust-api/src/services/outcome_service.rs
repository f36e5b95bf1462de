//! Best-effort side effects of a committed PASSED/FAILED verdict.
//!
//! The lifecycle controller hands an [`OutcomeNotice`] to the
//! [`OutcomeDispatcher`] after its transaction commits. [`OutcomeWorker`]
//! drains the channel in the background so that neither progress sync nor
//! event publishing can delay or undo the grading response. Events go out
//! in commit order; progress syncs run alongside, bounded by
//! [`MAX_CONCURRENT_SYNCS`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::metrics::record_outcome_effect;
use crate::models::{EnrollmentStatus, OutcomeNotice};
use crate::services::event_publisher::EventPublisher;
use crate::services::progress_client::{ProgressClient, ProgressError};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

pub const MAX_CONCURRENT_SYNCS: usize = 8;

#[derive(Clone)]
pub struct OutcomeDispatcher {
    sender: mpsc::UnboundedSender<OutcomeNotice>,
    pending: Arc<AtomicUsize>,
}

/// Receiving half of [`OutcomeDispatcher::channel`].
pub struct OutcomeQueue {
    receiver: mpsc::UnboundedReceiver<OutcomeNotice>,
    pending: Arc<AtomicUsize>,
}

impl OutcomeDispatcher {
    pub fn channel() -> (Self, OutcomeQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                pending: pending.clone(),
            },
            OutcomeQueue { receiver, pending },
        )
    }

    /// Never blocks. A closed channel is logged and the notice is dropped.
    pub fn dispatch(&self, notice: OutcomeNotice) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.sender.send(notice) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!(
                attempt_id = %err.0.attempt_id,
                "Outcome worker is gone, dropping {} notice",
                err.0.topic()
            );
            record_outcome_effect("dispatch", false);
        }
    }
}

#[derive(Clone)]
pub struct OutcomePropagator {
    progress: Arc<dyn ProgressClient>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryConfig,
}

impl OutcomePropagator {
    pub fn new(progress: Arc<dyn ProgressClient>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            progress,
            publisher,
            retry: RetryConfig::progress_sync(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Runs both effects independently; failures are logged and swallowed.
    pub async fn propagate(&self, notice: &OutcomeNotice) {
        self.publish(notice).await;
        if notice.passed {
            self.sync(notice).await;
        }
    }

    /// Single attempt, never retried here.
    async fn publish(&self, notice: &OutcomeNotice) {
        match self.publisher.publish(notice).await {
            Ok(()) => record_outcome_effect("publish", true),
            Err(err) => {
                record_outcome_effect("publish", false);
                error!(
                    error = %err,
                    attempt_id = %notice.attempt_id,
                    "Failed to publish {}",
                    notice.topic()
                );
            }
        }
    }

    async fn sync(&self, notice: &OutcomeNotice) {
        match self.sync_progress(notice).await {
            Ok(()) => record_outcome_effect("progress_sync", true),
            Err(err) => {
                record_outcome_effect("progress_sync", false);
                warn!(
                    error = %err,
                    attempt_id = %notice.attempt_id,
                    learner_id = %notice.learner_id,
                    "Progress sync failed, verdict stands"
                );
            }
        }
    }

    async fn sync_progress(&self, notice: &OutcomeNotice) -> Result<(), ProgressError> {
        let (Some(course_id), Some(module_id)) =
            (notice.course_id.as_deref(), notice.module_id.as_deref())
        else {
            return Ok(());
        };

        retry_async_with_config(self.retry.clone(), "progress_sync", || {
            self.sync_once(&notice.learner_id, course_id, module_id)
        })
        .await
    }

    async fn sync_once(
        &self,
        learner_id: &str,
        course_id: &str,
        module_id: &str,
    ) -> Result<(), ProgressError> {
        let Some(mut enrollment) = self.progress.enrollment(learner_id, course_id).await? else {
            warn!(
                "Learner {} has no enrollment in course {}, skipping progress sync",
                learner_id, course_id
            );
            return Ok(());
        };

        let already_complete = enrollment
            .module(module_id)
            .map(|m| m.completed)
            .unwrap_or(false);
        if !already_complete {
            self.progress
                .mark_module_complete(&enrollment.id, module_id)
                .await?;
            enrollment.complete_module(module_id);
        }

        let percent = enrollment.completion_percent();
        let status = EnrollmentStatus::for_percent(percent);
        if percent != enrollment.progress_percent || status != enrollment.status {
            self.progress
                .update_enrollment(&enrollment.id, percent, status)
                .await?;
        }

        info!(
            "Enrollment {} synced: module {} complete, {}%",
            enrollment.id, module_id, percent
        );
        Ok(())
    }
}

pub struct OutcomeWorker {
    receiver: mpsc::UnboundedReceiver<OutcomeNotice>,
    pending: Arc<AtomicUsize>,
    propagator: OutcomePropagator,
    syncs: Arc<Semaphore>,
}

impl OutcomeWorker {
    pub fn new(queue: OutcomeQueue, propagator: OutcomePropagator) -> Self {
        Self {
            receiver: queue.receiver,
            pending: queue.pending,
            propagator,
            syncs: Arc::new(Semaphore::new(MAX_CONCURRENT_SYNCS)),
        }
    }

    pub fn spawn(self) -> OutcomeWorkerHandle {
        let (stop, stop_signal) = oneshot::channel();
        let pending = self.pending.clone();
        OutcomeWorkerHandle {
            stop,
            task: tokio::spawn(self.run(stop_signal)),
            pending,
        }
    }

    /// Publishes notices in arrival order until every dispatcher is dropped
    /// or a stop is requested, then waits for in-flight progress syncs.
    pub async fn run(mut self, mut stop_signal: oneshot::Receiver<()>) {
        info!("Starting outcome propagation worker");
        let mut in_flight = JoinSet::new();
        let mut listening = true;

        loop {
            let next = if listening {
                tokio::select! {
                    notice = self.receiver.recv() => Ok(notice),
                    stop = &mut stop_signal => Err(stop.is_ok()),
                }
            } else {
                Ok(self.receiver.recv().await)
            };

            let notice = match next {
                Ok(Some(notice)) => notice,
                Ok(None) => break,
                Err(requested) => {
                    listening = false;
                    if requested {
                        info!("Outcome worker stopping, draining queued notices");
                        // Buffered notices are still delivered by recv()
                        self.receiver.close();
                    }
                    continue;
                }
            };

            while in_flight.try_join_next().is_some() {}
            self.propagator.publish(&notice).await;

            if !notice.passed {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let permit = match self.syncs.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            };
            let propagator = self.propagator.clone();
            let pending = self.pending.clone();
            in_flight.spawn(async move {
                propagator.sync(&notice).await;
                pending.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        while in_flight.join_next().await.is_some() {}
        info!("Outcome channel closed, worker stopping");
    }
}

/// Owner's handle on a spawned [`OutcomeWorker`].
pub struct OutcomeWorkerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    pending: Arc<AtomicUsize>,
}

impl OutcomeWorkerHandle {
    /// Notices not yet fully propagated.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting notices and waits up to `grace` for the queued ones.
    /// Returns false if anything was left behind.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.stop.send(());
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(())) => {
                info!("Outcome worker drained");
                true
            }
            Ok(Err(err)) => {
                error!(error = %err, "Outcome worker task failed");
                false
            }
            Err(_) => {
                error!(
                    pending = self.pending.load(Ordering::SeqCst),
                    "Outcome worker did not drain within {:?}, abandoning queued notices",
                    grace
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Enrollment, ModuleProgress};
    use crate::services::event_publisher::PublishError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FlakyProgress {
        failures_left: AtomicUsize,
        completed: Mutex<Vec<String>>,
        updates: Mutex<Vec<(u8, EnrollmentStatus)>>,
    }

    #[async_trait]
    impl ProgressClient for FlakyProgress {
        async fn enrollment(
            &self,
            learner_id: &str,
            course_id: &str,
        ) -> Result<Option<Enrollment>, ProgressError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProgressError::Unavailable("connection refused".to_string()));
            }
            Ok(Some(Enrollment {
                id: "e1".to_string(),
                learner_id: learner_id.to_string(),
                course_id: course_id.to_string(),
                status: EnrollmentStatus::InProgress,
                progress_percent: 50,
                modules: vec![
                    ModuleProgress {
                        module_id: "m1".to_string(),
                        title: None,
                        mandatory: true,
                        completed: true,
                    },
                    ModuleProgress {
                        module_id: "m2".to_string(),
                        title: None,
                        mandatory: true,
                        completed: false,
                    },
                ],
            }))
        }

        async fn mark_module_complete(
            &self,
            _enrollment_id: &str,
            module_id: &str,
        ) -> Result<(), ProgressError> {
            self.completed.lock().unwrap().push(module_id.to_string());
            Ok(())
        }

        async fn update_enrollment(
            &self,
            _enrollment_id: &str,
            progress_percent: u8,
            status: EnrollmentStatus,
        ) -> Result<(), ProgressError> {
            self.updates.lock().unwrap().push((progress_percent, status));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingPublisher {
        fail: bool,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for CountingPublisher {
        async fn publish(&self, notice: &OutcomeNotice) -> Result<(), PublishError> {
            self.published.lock().unwrap().push(notice.topic().to_string());
            if self.fail {
                return Err(PublishError::Channel("stream unavailable".to_string()));
            }
            Ok(())
        }
    }

    fn notice(passed: bool) -> OutcomeNotice {
        OutcomeNotice {
            attempt_id: "t1".to_string(),
            assessment_code: "A1".to_string(),
            course_id: Some("c1".to_string()),
            module_id: Some("m2".to_string()),
            learner_id: "l1".to_string(),
            score: if passed { 80.0 } else { 40.0 },
            passed,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter_max: None,
        }
    }

    #[tokio::test]
    async fn pass_completes_module_and_publishes() {
        let progress = Arc::new(FlakyProgress::default());
        progress.failures_left.store(2, Ordering::SeqCst);
        let publisher = Arc::new(CountingPublisher::default());
        let propagator = OutcomePropagator::new(progress.clone(), publisher.clone())
            .with_retry(fast_retry());

        propagator.propagate(&notice(true)).await;

        assert_eq!(*progress.completed.lock().unwrap(), vec!["m2".to_string()]);
        assert_eq!(
            *progress.updates.lock().unwrap(),
            vec![(100, EnrollmentStatus::Complete)]
        );
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec!["assessment.passed".to_string()]
        );
    }

    #[tokio::test]
    async fn fail_publishes_without_touching_progress() {
        let progress = Arc::new(FlakyProgress::default());
        let publisher = Arc::new(CountingPublisher::default());
        let propagator = OutcomePropagator::new(progress.clone(), publisher.clone());

        propagator.propagate(&notice(false)).await;

        assert!(progress.completed.lock().unwrap().is_empty());
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec!["assessment.failed".to_string()]
        );
    }

    #[tokio::test]
    async fn progress_outage_does_not_block_publishing() {
        let progress = Arc::new(FlakyProgress::default());
        progress.failures_left.store(usize::MAX, Ordering::SeqCst);
        let publisher = Arc::new(CountingPublisher {
            fail: true,
            ..Default::default()
        });
        let propagator = OutcomePropagator::new(progress.clone(), publisher.clone())
            .with_retry(fast_retry());

        propagator.propagate(&notice(true)).await;

        assert!(progress.updates.lock().unwrap().is_empty());
        // A failed publish is attempted exactly once
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_drains_until_dispatchers_drop() {
        let publisher = Arc::new(CountingPublisher::default());
        let propagator =
            OutcomePropagator::new(Arc::new(FlakyProgress::default()), publisher.clone());
        let (dispatcher, queue) = OutcomeDispatcher::channel();
        let handle = OutcomeWorker::new(queue, propagator).spawn();

        dispatcher.dispatch(notice(false));
        dispatcher.dispatch(notice(true));
        drop(dispatcher);

        tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_delivers_notices_queued_before_it() {
        let progress = Arc::new(FlakyProgress::default());
        let publisher = Arc::new(CountingPublisher::default());
        let propagator = OutcomePropagator::new(progress.clone(), publisher.clone());
        let (dispatcher, queue) = OutcomeDispatcher::channel();
        let handle = OutcomeWorker::new(queue, propagator).spawn();

        // The worker has not been polled yet on this runtime
        dispatcher.dispatch(notice(true));
        dispatcher.dispatch(notice(false));
        assert_eq!(handle.pending(), 2);

        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec!["assessment.passed".to_string(), "assessment.failed".to_string()]
        );
        assert_eq!(*progress.completed.lock().unwrap(), vec!["m2".to_string()]);

        // Late verdicts are refused instead of silently queued
        dispatcher.dispatch(notice(true));
        assert_eq!(dispatcher.pending.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_the_grace_period() {
        let progress = Arc::new(FlakyProgress::default());
        progress.failures_left.store(usize::MAX, Ordering::SeqCst);
        let publisher = Arc::new(CountingPublisher::default());
        let propagator = OutcomePropagator::new(progress, publisher).with_retry(RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(500),
            jitter_max: None,
        });
        let (dispatcher, queue) = OutcomeDispatcher::channel();
        let handle = OutcomeWorker::new(queue, propagator).spawn();

        dispatcher.dispatch(notice(true));

        assert!(!handle.shutdown(Duration::from_millis(50)).await);
    }

    #[derive(Default)]
    struct StalledProgress {
        completed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProgressClient for StalledProgress {
        async fn enrollment(
            &self,
            learner_id: &str,
            course_id: &str,
        ) -> Result<Option<Enrollment>, ProgressError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Some(Enrollment {
                id: format!("e-{}", learner_id),
                learner_id: learner_id.to_string(),
                course_id: course_id.to_string(),
                status: EnrollmentStatus::InProgress,
                progress_percent: 0,
                modules: vec![ModuleProgress {
                    module_id: "m2".to_string(),
                    title: None,
                    mandatory: true,
                    completed: false,
                }],
            }))
        }

        async fn mark_module_complete(
            &self,
            enrollment_id: &str,
            _module_id: &str,
        ) -> Result<(), ProgressError> {
            self.completed.lock().unwrap().push(enrollment_id.to_string());
            Ok(())
        }

        async fn update_enrollment(
            &self,
            _enrollment_id: &str,
            _progress_percent: u8,
            _status: EnrollmentStatus,
        ) -> Result<(), ProgressError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_progress_sync_does_not_hold_back_later_events() {
        let progress = Arc::new(StalledProgress::default());
        let publisher = Arc::new(CountingPublisher::default());
        let propagator = OutcomePropagator::new(progress.clone(), publisher.clone());
        let (dispatcher, queue) = OutcomeDispatcher::channel();
        let handle = OutcomeWorker::new(queue, propagator).spawn();

        let mut second = notice(true);
        second.learner_id = "l2".to_string();
        dispatcher.dispatch(notice(true));
        dispatcher.dispatch(second);
        dispatcher.dispatch(notice(false));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.published.lock().unwrap().len(), 3);
        assert!(progress.completed.lock().unwrap().is_empty());

        assert!(handle.shutdown(Duration::from_secs(2)).await);
        let mut completed = progress.completed.lock().unwrap().clone();
        completed.sort();
        assert_eq!(completed, vec!["e-l1".to_string(), "e-l2".to_string()]);
    }
}
