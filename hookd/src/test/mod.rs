//! End-to-end delivery tests: publisher, daemon, worker and in-memory backends
//! against wiremock subscribers.

pub mod utils;

use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::DeliveryMode;
use crate::db::models::delivery_logs::DeliveryStatus;
use crate::queue::{JobPayload, JobQueue, JobStatus, RetryPolicy};
use crate::webhooks::signing;
use utils::{Harness, fast_policy};

#[tokio::test]
async fn test_e2e_candidate_created_delivered_once() {
    let mock_server = MockServer::start().await;
    let harness = Harness::start(DeliveryMode::WholeJob, RetryPolicy::default());
    let subscription = harness
        .store
        .add_subscription("candidate.created", &format!("{}/hooks/candidates", mock_server.uri()))
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/hooks/candidates"))
        .and(header("content-type", "application/json"))
        .and(header(
            "x-hookd-signature",
            signing::sign(&subscription.secret_key, br#"{"id":1}"#).as_str(),
        ))
        .and(body_string(r#"{"id":1}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let published = harness
        .publisher
        .publish("candidate.created", json!({"id": 1}))
        .await
        .unwrap();
    let job = harness.wait_for_terminal(published.job_id).await;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(harness.store.event_count(), 1);

    let logs = harness.store.delivery_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].subscription_id, subscription.id);
    assert_eq!(logs[0].event_id, published.event_id);
    assert_eq!(logs[0].delivery_status(), DeliveryStatus::Success);
    assert_eq!(logs[0].response_status_code, Some(200));
    assert_eq!(logs[0].response_body.as_deref(), Some(r#"{"ok":true}"#));

    harness.stop().await;
}

#[tokio::test]
async fn test_healthy_subscribers_each_get_one_row_in_order() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(4)
        .mount(&mock_server)
        .await;

    let harness = Harness::start(DeliveryMode::WholeJob, fast_policy());
    let ids: Vec<_> = (0..4)
        .map(|n| {
            harness
                .store
                .add_subscription("job.posted", &format!("{}/s{n}", mock_server.uri()))
                .unwrap()
                .id
        })
        .collect();

    let published = harness.publisher.publish("job.posted", json!({"title": "SRE"})).await.unwrap();
    assert_eq!(harness.wait_for_terminal(published.job_id).await.status, JobStatus::Succeeded);

    let logs = harness.store.delivery_logs_for_event(published.event_id);
    assert_eq!(logs.iter().map(|log| log.subscription_id).collect::<Vec<_>>(), ids);
    assert!(logs.iter().all(|log| log.response_status_code == Some(202)));

    harness.stop().await;
}

#[tokio::test]
async fn test_whole_job_retry_duplicates_healthy_subscriber() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .mount(&mock_server)
        .await;

    let harness = Harness::start(DeliveryMode::WholeJob, fast_policy());
    let healthy = harness
        .store
        .add_subscription("candidate.created", &format!("{}/healthy", mock_server.uri()))
        .unwrap();
    let broken = harness
        .store
        .add_subscription("candidate.created", &format!("{}/broken", mock_server.uri()))
        .unwrap();

    let published = harness.publisher.publish("candidate.created", json!({"id": 9})).await.unwrap();
    let job = harness.wait_for_terminal(published.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);

    let logs = harness.store.delivery_logs();
    let healthy_rows: Vec<_> = logs.iter().filter(|log| log.subscription_id == healthy.id).collect();
    let broken_rows: Vec<_> = logs.iter().filter(|log| log.subscription_id == broken.id).collect();

    assert_eq!(healthy_rows.len(), 3);
    assert!(healthy_rows.iter().all(|log| log.delivery_status() == DeliveryStatus::Success));
    assert_eq!(broken_rows.len(), 3);
    assert!(broken_rows.iter().all(|log| {
        log.delivery_status() == DeliveryStatus::Failed
            && log.response_status_code == Some(500)
            && log.response_body.as_deref() == Some("db down")
    }));

    harness.stop().await;
}

#[tokio::test]
async fn test_per_subscriber_retry_isolates_failures() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let harness = Harness::start(DeliveryMode::PerSubscriber, fast_policy());
    let healthy = harness
        .store
        .add_subscription("candidate.created", &format!("{}/healthy", mock_server.uri()))
        .unwrap();
    let broken = harness
        .store
        .add_subscription("candidate.created", &format!("{}/broken", mock_server.uri()))
        .unwrap();

    let published = harness.publisher.publish("candidate.created", json!({"id": 9})).await.unwrap();
    let job = harness.wait_for_terminal(published.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.delivered, vec![healthy.id]);

    let logs = harness.store.delivery_logs();
    assert_eq!(logs.iter().filter(|log| log.subscription_id == healthy.id).count(), 1);
    assert_eq!(logs.iter().filter(|log| log.subscription_id == broken.id).count(), 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let mock_server = MockServer::start().await;
    // First request fails, then the fallback mock takes over
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let harness = Harness::start(DeliveryMode::WholeJob, fast_policy());
    harness.store.add_subscription("job.posted", &mock_server.uri()).unwrap();

    let published = harness.publisher.publish("job.posted", json!({"id": 3})).await.unwrap();
    let job = harness.wait_for_terminal(published.job_id).await;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 2);

    let statuses: Vec<_> = harness
        .store
        .delivery_logs()
        .iter()
        .map(|log| log.response_status_code)
        .collect();
    assert_eq!(statuses, vec![Some(502), Some(200)]);

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_event_exhausts_retries_without_logs() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let harness = Harness::start(DeliveryMode::WholeJob, fast_policy());
    harness.store.add_subscription("candidate.created", &mock_server.uri()).unwrap();

    // A job whose event row never existed
    let job_id = harness
        .queue
        .enqueue(&JobPayload::new(Uuid::new_v4(), "candidate.created"), &fast_policy())
        .await
        .unwrap();
    let job = harness.wait_for_terminal(job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);
    assert!(job.last_error.unwrap().contains("not found"));
    assert!(harness.store.delivery_logs().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_unsupported_payload_version_is_rejected() {
    let harness = Harness::start(DeliveryMode::WholeJob, fast_policy());

    let job_id = harness.queue.enqueue_raw(
        json!({"version": 2, "event_id": Uuid::new_v4(), "event_type": "candidate.created"}),
        &fast_policy(),
    );
    let job = harness.wait_for_terminal(job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);

    harness.stop().await;
}
