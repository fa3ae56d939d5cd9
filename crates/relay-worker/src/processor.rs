//! Forwarding of validated jobs to the downstream processing service.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use relay_core::config::DownstreamConfig;
use relay_core::error::{AppError, ErrorKind};
use relay_core::result::AppResult;
use relay_core::types::job::Job;

use crate::error::JobFailure;

/// Path appended to the downstream base URL.
pub const PROCESS_PATH: &str = "/api/process";

/// Handles one validated job. Exactly one attempt per call; retries are the
/// broker's business.
#[async_trait]
pub trait JobProcessor: Send + Sync + std::fmt::Debug + 'static {
    /// Process the job.
    async fn process(&self, job: &Job) -> Result<(), JobFailure>;
}

/// Posts each job as JSON to `{base_url}/api/process`.
#[derive(Debug, Clone)]
pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProcessor {
    /// Create a processor with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AppError::with_source(ErrorKind::Configuration, "Failed to build HTTP client", e)
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}{PROCESS_PATH}", base_url.trim_end_matches('/')),
        })
    }

    /// Create a processor from validated downstream settings.
    pub fn from_config(config: &DownstreamConfig) -> AppResult<Self> {
        Self::new(config.require_base_url()?, config.timeout())
    }

    /// Full URL jobs are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl JobProcessor for HttpProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(job)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobFailure::DownstreamHttp {
                status: status.as_u16(),
                body,
            });
        }

        match response.text().await {
            Ok(body) => debug!(
                job_id = %job.job_id,
                status = status.as_u16(),
                body = %body,
                "Downstream accepted job"
            ),
            Err(e) => debug!(
                job_id = %job.job_id,
                status = status.as_u16(),
                error = %e,
                "Downstream accepted job; response body unreadable"
            ),
        }
        Ok(())
    }
}

/// Map a client error to the failure taxonomy.
fn classify(err: reqwest::Error) -> JobFailure {
    if err.is_builder() {
        JobFailure::RequestConstruction { source: err }
    } else if err.is_timeout() || err.is_connect() || err.is_request() {
        JobFailure::DownstreamUnreachable { source: err }
    } else {
        JobFailure::unknown(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_job() -> Job {
        Job::new("wamid.1", "comp-1", "conv-1", "hello")
            .with_created_at("2024-05-01T10:00:00.000Z")
    }

    #[tokio::test]
    async fn test_posts_job_as_json() {
        let server = MockServer::start().await;
        let job = sample_job();
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "job_id": "wamid.1",
                "company_id": "comp-1",
                "conversation_id": "conv-1",
                "message": "hello",
                "channel": "whatsapp",
                "created_at": "2024-05-01T10:00:00.000Z"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let processor =
            HttpProcessor::new(&format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        assert!(processor.endpoint().ends_with("/api/process"));
        assert!(!processor.endpoint().contains("//api"));
        processor.process(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_2xx_with_stalled_body_is_success() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.ends_with(b"}") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n{\"status\":")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let processor =
            HttpProcessor::new(&format!("http://{addr}"), Duration::from_millis(500)).unwrap();
        processor.process(&sample_job()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_is_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string(r#"{"error":"overloaded"}"#))
            .mount(&server)
            .await;

        let processor = HttpProcessor::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let failure = processor.process(&sample_job()).await.unwrap_err();

        assert!(matches!(failure, JobFailure::DownstreamHttp { status: 503, .. }));
        let message = failure.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("overloaded"));
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let processor = HttpProcessor::new(&server.uri(), Duration::from_millis(50)).unwrap();
        let failure = processor.process(&sample_job()).await.unwrap_err();

        assert!(matches!(failure, JobFailure::DownstreamUnreachable { .. }));
        assert_eq!(failure.status(), None);
        assert!(!failure.to_string().contains("HTTP"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let processor =
            HttpProcessor::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let failure = processor.process(&sample_job()).await.unwrap_err();
        assert!(matches!(failure, JobFailure::DownstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_malformed_target_is_request_construction() {
        let processor = HttpProcessor::new("not a url", Duration::from_secs(1)).unwrap();
        let failure = processor.process(&sample_job()).await.unwrap_err();
        assert!(matches!(failure, JobFailure::RequestConstruction { .. }));
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let err = HttpProcessor::from_config(&DownstreamConfig::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
