use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

use crate::config::EventsConfig;
use crate::metrics::track_cache_operation;
use crate::models::{AssessmentEvent, OutcomeNotice};
use crate::models::event::EventEnvelope;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event channel error: {0}")]
    Channel(String),
}

impl From<redis::RedisError> for PublishError {
    fn from(err: redis::RedisError) -> Self {
        PublishError::Channel(err.to_string())
    }
}

/// Durable outbound channel for assessment verdicts.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, notice: &OutcomeNotice) -> Result<(), PublishError>;
}

/// Appends enveloped events to one Redis stream per topic.
pub struct RedisStreamPublisher {
    redis: ConnectionManager,
    stream_prefix: String,
    max_len: u64,
}

impl RedisStreamPublisher {
    pub fn new(redis: ConnectionManager, config: &EventsConfig) -> Self {
        Self {
            redis,
            stream_prefix: config.stream_prefix.clone(),
            max_len: config.max_len,
        }
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.stream_prefix, topic)
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, notice: &OutcomeNotice) -> Result<(), PublishError> {
        let topic = notice.topic();
        let envelope = EventEnvelope::new(topic, AssessmentEvent::from(notice));
        let body = serde_json::to_string(&envelope)?;
        let key = self.stream_key(topic);
        let mut conn = self.redis.clone();

        let entry_id: String = track_cache_operation("xadd", async {
            redis::cmd("XADD")
                .arg(&key)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.max_len)
                .arg("*")
                .arg("event_id")
                .arg(&envelope.event_id)
                .arg("type")
                .arg(topic)
                .arg("data")
                .arg(&body)
                .query_async(&mut conn)
                .await
        })
        .await?;

        tracing::debug!(
            stream = %key,
            entry_id = %entry_id,
            event_id = %envelope.event_id,
            "Published {} for attempt {}",
            topic,
            notice.attempt_id
        );
        Ok(())
    }
}
