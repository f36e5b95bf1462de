use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::config::ProgressConfig;
use crate::models::{Enrollment, EnrollmentStatus};

/// RFC 3986 unreserved characters stay as-is inside a path segment.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum ProgressError {
    /// Transport failure or timeout.
    #[error("progress tracker unreachable: {0}")]
    Unavailable(String),

    #[error("progress tracker returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid progress tracker response: {0}")]
    Decode(String),
}

/// Course progress tracker, read during gating and written after a pass.
#[async_trait]
pub trait ProgressClient: Send + Sync {
    /// `None` when the learner is not enrolled in the course.
    async fn enrollment(
        &self,
        learner_id: &str,
        course_id: &str,
    ) -> Result<Option<Enrollment>, ProgressError>;

    async fn mark_module_complete(
        &self,
        enrollment_id: &str,
        module_id: &str,
    ) -> Result<(), ProgressError>;

    async fn update_enrollment(
        &self,
        enrollment_id: &str,
        progress_percent: u8,
        status: EnrollmentStatus,
    ) -> Result<(), ProgressError>;
}

#[derive(Serialize)]
struct EnrollmentUpdate {
    progress_percent: u8,
    status: EnrollmentStatus,
}

pub struct HttpProgressClient {
    base_url: String,
    http_client: Client,
}

impl HttpProgressClient {
    pub fn new(config: &ProgressConfig) -> Result<Self, ProgressError> {
        let http_client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProgressError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: config.url.clone(),
            http_client,
        })
    }

    fn enrollment_url(&self, enrollment_id: &str) -> String {
        format!(
            "{}/progress/v1/enrollments/{}",
            self.base_url.trim_end_matches('/'),
            utf8_percent_encode(enrollment_id, PATH_SEGMENT_ENCODE_SET)
        )
    }

    fn module_complete_url(&self, enrollment_id: &str, module_id: &str) -> String {
        format!(
            "{}/modules/{}/complete",
            self.enrollment_url(enrollment_id),
            utf8_percent_encode(module_id, PATH_SEGMENT_ENCODE_SET)
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProgressError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ProgressError::Rejected { status, body })
    }
}

fn transport(err: reqwest::Error) -> ProgressError {
    ProgressError::Unavailable(err.to_string())
}

#[async_trait]
impl ProgressClient for HttpProgressClient {
    async fn enrollment(
        &self,
        learner_id: &str,
        course_id: &str,
    ) -> Result<Option<Enrollment>, ProgressError> {
        let url = format!(
            "{}/progress/v1/enrollments",
            self.base_url.trim_end_matches('/')
        );

        let response = self
            .http_client
            .get(&url)
            .query(&[("learner_id", learner_id), ("course_id", course_id)])
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let enrollment = Self::check(response)
            .await?
            .json::<Enrollment>()
            .await
            .map_err(|e| ProgressError::Decode(e.to_string()))?;
        Ok(Some(enrollment))
    }

    async fn mark_module_complete(
        &self,
        enrollment_id: &str,
        module_id: &str,
    ) -> Result<(), ProgressError> {
        let url = self.module_complete_url(enrollment_id, module_id);

        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_enrollment(
        &self,
        enrollment_id: &str,
        progress_percent: u8,
        status: EnrollmentStatus,
    ) -> Result<(), ProgressError> {
        let url = self.enrollment_url(enrollment_id);

        let response = self
            .http_client
            .patch(&url)
            .json(&EnrollmentUpdate {
                progress_percent,
                status,
            })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> HttpProgressClient {
        HttpProgressClient::new(&ProgressConfig {
            url: url.to_string(),
            timeout_ms: 100,
        })
        .unwrap()
    }

    #[test]
    fn ids_are_encoded_as_single_path_segments() {
        let client = client("http://progress.local/");

        assert_eq!(
            client.enrollment_url("enr/1?x#y"),
            "http://progress.local/progress/v1/enrollments/enr%2F1%3Fx%23y"
        );
        assert_eq!(
            client.module_complete_url("enr-1", "module 2/b"),
            "http://progress.local/progress/v1/enrollments/enr-1/modules/module%202%2Fb/complete"
        );
    }

    #[test]
    fn plain_ids_are_left_untouched() {
        let client = client("http://progress.local");

        assert_eq!(
            client.module_complete_url("enr_1.a~b", "module-quiz"),
            "http://progress.local/progress/v1/enrollments/enr_1.a~b/modules/module-quiz/complete"
        );
    }
}
