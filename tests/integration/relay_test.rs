//! Integration tests for the relay pipeline.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{BackoffPolicy, JobOptions, RetentionSet};
use relay_worker::DrainState;

use crate::helpers::{TestRelay, sample_job};

fn quick_retry(attempts: u32) -> JobOptions {
    JobOptions {
        attempts,
        backoff: Some(BackoffPolicy::Fixed { delay: 10 }),
    }
}

#[tokio::test]
async fn test_successful_job_reaches_completed_set() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/process"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "queued"})))
        .expect(1)
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay.enqueue(&sample_job("wamid.ok"), &JobOptions::producer_default()).await;

    let completed = relay.wait_for(RetentionSet::Completed, 1).await;
    assert_eq!(completed[0].id, "wamid.ok");
    assert_eq!(completed[0].attempts_made, 1);
    assert_eq!(completed[0].payload["company_id"], "comp-1");

    assert_eq!(relay.shutdown().await, DrainState::Drained);
}

#[tokio::test]
async fn test_payload_is_forwarded_verbatim() {
    let payload = json!({
        "job_id": "wamid.extra",
        "company_id": "comp-1",
        "conversation_id": "conv-1",
        "message": "hola",
        "channel": "whatsapp",
        "created_at": "2024-05-01T10:00:00.000Z",
        "metadata": {"wa_name": "Ana", "tags": [1, 2]},
        "priority": "high"
    });

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/process"))
        .and(body_json(payload.clone()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay
        .enqueue_raw("wamid.extra", payload.clone(), &JobOptions::producer_default())
        .await;

    relay.wait_for(RetentionSet::Completed, 1).await;
    let received = relay.downstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body, payload);

    assert_eq!(relay.shutdown().await, DrainState::Drained);
}

#[tokio::test]
async fn test_server_error_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/process"))
        .respond_with(ResponseTemplate::new(500).set_body_string("agent crashed"))
        .expect(2)
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay.enqueue(&sample_job("wamid.500"), &quick_retry(2)).await;

    let failed = relay.wait_for(RetentionSet::Failed, 1).await;
    assert_eq!(failed[0].id, "wamid.500");
    assert_eq!(failed[0].attempts_made, 2);
    let reason = failed[0].failed_reason.as_deref().unwrap_or_default();
    assert!(reason.contains("500"), "reason was {reason}");
    assert!(reason.contains("agent crashed"));

    assert!(relay.queue.records(RetentionSet::Completed, 10).await.unwrap().is_empty());
    relay.shutdown().await;
}

#[tokio::test]
async fn test_invalid_payload_never_reaches_downstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay
        .enqueue_raw(
            "broken",
            json!({"job_id": "broken", "company_id": 7}),
            &quick_retry(3),
        )
        .await;

    let failed = relay.wait_for(RetentionSet::Failed, 1).await;
    assert_eq!(failed[0].attempts_made, 3);
    assert!(
        failed[0]
            .failed_reason
            .as_deref()
            .unwrap_or_default()
            .starts_with("invalid job payload")
    );
    relay.shutdown().await;
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay.enqueue(&sample_job("wamid.flaky"), &quick_retry(3)).await;

    let completed = relay.wait_for(RetentionSet::Completed, 1).await;
    assert_eq!(completed[0].attempts_made, 2);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_job_id_is_processed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .expect(1)
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    let job = sample_job("wamid.dup");
    relay.enqueue(&job, &JobOptions::producer_default()).await;
    relay.enqueue(&job, &JobOptions::producer_default()).await;

    relay.wait_for(RetentionSet::Completed, 1).await;
    assert_eq!(relay.queue.counts().await.unwrap().waiting, 0);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let relay = TestRelay::start(server).await;
    relay.enqueue(&sample_job("wamid.slow"), &JobOptions::default()).await;

    while relay.queue.counts().await.unwrap().active == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let queue = relay.queue.clone();
    assert_eq!(relay.shutdown().await, DrainState::Drained);
    assert_eq!(queue.counts().await.unwrap().completed, 1);
}
