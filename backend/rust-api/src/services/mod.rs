use crate::config::Config;
use anyhow::Context;
use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::store::{AttemptStore, MongoStore};
use attempt_service::{system_clock, AttemptService, Clock};
use catalog::{Catalog, MongoCatalog};
use event_publisher::{EventPublisher, RedisStreamPublisher};
use outcome_service::{
    OutcomeDispatcher, OutcomePropagator, OutcomeWorker, OutcomeWorkerHandle,
};
use progress_client::{HttpProgressClient, ProgressClient};
use review_service::ReviewService;

pub mod attempt_service;
pub mod catalog;
pub mod event_publisher;
pub mod outcome_service;
pub mod progress_client;
pub mod review_service;
pub mod scoring;

/// Everything the engine talks to, injected at construction.
pub struct Collaborators {
    pub store: Arc<dyn AttemptStore>,
    pub catalog: Arc<dyn Catalog>,
    pub progress: Arc<dyn ProgressClient>,
    pub publisher: Arc<dyn EventPublisher>,
    pub clock: Clock,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn AttemptStore>,
    pub attempts: Arc<AttemptService>,
    pub reviews: ReviewService,
    /// Probed by the health check when present.
    pub redis: Option<ConnectionManager>,
    outcome_worker: Mutex<Option<OutcomeWorkerHandle>>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let mongo = mongo_client.database(&config.mongo_database);
        let store = MongoStore::new(
            mongo_client,
            &config.mongo_database,
            redis.clone(),
            Duration::from_millis(config.lock_ttl_ms),
        );
        store
            .ensure_indexes()
            .await
            .context("Failed to create attempt store indexes")?;

        let progress = HttpProgressClient::new(&config.progress)
            .context("Failed to build progress tracker client")?;
        let publisher = RedisStreamPublisher::new(redis.clone(), &config.events);

        let collaborators = Collaborators {
            store: Arc::new(store),
            catalog: Arc::new(MongoCatalog::new(&mongo)),
            progress: Arc::new(progress),
            publisher: Arc::new(publisher),
            clock: system_clock(),
        };

        Ok(Self::with_collaborators(config, collaborators, Some(redis)))
    }

    /// Wires the services and spawns the outcome worker. Must be called
    /// from within a Tokio runtime.
    pub fn with_collaborators(
        config: Config,
        collaborators: Collaborators,
        redis: Option<ConnectionManager>,
    ) -> Self {
        let (dispatcher, queue) = OutcomeDispatcher::channel();
        let propagator =
            OutcomePropagator::new(collaborators.progress.clone(), collaborators.publisher);
        let outcome_worker = OutcomeWorker::new(queue, propagator).spawn();

        let attempts = Arc::new(
            AttemptService::new(
                collaborators.store.clone(),
                collaborators.catalog.clone(),
                collaborators.progress,
                dispatcher,
                config.progress.timeout(),
            )
            .with_clock(collaborators.clock),
        );
        let reviews = ReviewService::new(
            collaborators.store.clone(),
            collaborators.catalog,
            attempts.clone(),
        );

        Self {
            config,
            store: collaborators.store,
            attempts,
            reviews,
            redis,
            outcome_worker: Mutex::new(Some(outcome_worker)),
        }
    }

    /// Stops outcome propagation once the server has stopped taking
    /// requests. Queued verdicts get `grace` to go out; later calls are
    /// no-ops.
    pub async fn shutdown(&self, grace: Duration) {
        let Some(worker) = self.outcome_worker.lock().await.take() else {
            return;
        };
        let pending = worker.pending();
        if pending > 0 {
            tracing::info!("Draining {} outcome notices before exit", pending);
        }
        worker.shutdown(grace).await;
    }
}
