//! Integration tests for job submission against a mock Save Page Now API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use serp_wayback_archiver::canonical::canonicalize;
use serp_wayback_archiver::config::Config;
use serp_wayback_archiver::store::{load_job_ids, StateStore};
use serp_wayback_archiver::wayback::{Fault, SubmitOutcome, Submitter, WaybackClient};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Create a test configuration pointed at the mock server.
fn create_test_config(server: &MockServer) -> Config {
    Config {
        wayback_endpoint: format!("{}/save/", server.uri()),
        ..Config::for_testing()
    }
}

fn setup_submitter(config: &Config) -> (Submitter, Arc<StateStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = StateStore::open(
        &temp_dir.path().join("job_ids.csv"),
        &temp_dir.path().join("wayback_urls.csv"),
        Duration::from_secs(20 * 3600),
        Utc::now(),
    )
    .expect("Failed to open state store");
    let store = Arc::new(store);
    let client = WaybackClient::new(config).expect("Failed to create client");
    let submitter = Submitter::new(
        Arc::new(client),
        Arc::clone(&store),
        config.clone(),
        CancellationToken::new(),
    );
    (submitter, store, temp_dir)
}

#[tokio::test]
async fn test_second_submit_reuses_recorded_job_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://example.com/a?x=1%20",
            "job_id": "J1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, store, temp_dir) = setup_submitter(&config);
    let url = canonicalize("https://example.com/a?x=1%20");

    let first = submitter.submit(&url, false).await.expect("submit failed");
    let SubmitOutcome::Accepted(first) = first else {
        panic!("expected an accepted job, got {first:?}");
    };
    assert_eq!(first.job_id, "J1");
    assert!(!first.reused);

    let second = submitter.submit(&url, false).await.expect("submit failed");
    let SubmitOutcome::Accepted(second) = second else {
        panic!("expected an accepted job, got {second:?}");
    };
    assert_eq!(second.job_id, "J1");
    assert!(second.reused);

    assert_eq!(store.job_id(&url).await.as_deref(), Some("J1"));
    let on_disk = load_job_ids(&temp_dir.path().join("job_ids.csv")).unwrap();
    assert_eq!(on_disk.get(&url).map(String::as_str), Some("J1"));
}

#[tokio::test]
async fn test_rate_limited_twice_then_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://example.com/page",
            "job_id": "J-final"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, _store, temp_dir) = setup_submitter(&config);
    let url = canonicalize("https://example.com/page");

    let outcome = submitter.submit(&url, false).await.expect("submit failed");
    assert!(matches!(
        outcome,
        SubmitOutcome::Accepted(ref handle) if handle.job_id == "J-final"
    ));

    let contents = std::fs::read_to_string(temp_dir.path().join("job_ids.csv")).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert_eq!(contents.trim(), "https://example.com/page,J-final");
}

#[tokio::test]
async fn test_request_carries_form_fields_and_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .and(header("authorization", "LOW access:secret"))
        .and(header("accept", "application/json"))
        .and(body_string_contains("if_not_archived_within=20h"))
        .and(body_string_contains("capture_outlinks=1"))
        .and(body_string_contains("url=https%3A%2F%2Fwww.google.com%2Fsearch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "JQ"})))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        wayback_access_key: Some("access".to_string()),
        wayback_secret_key: Some("secret".to_string()),
        ..create_test_config(&server)
    };
    let (submitter, _store, _temp_dir) = setup_submitter(&config);

    let outcome = submitter
        .submit(&canonicalize("https://www.google.com/search?q=rust"), true)
        .await
        .expect("submit failed");
    assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
}

#[tokio::test]
async fn test_hard_fault_is_abandoned_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad keys"))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, store, _temp_dir) = setup_submitter(&config);
    let url = canonicalize("https://example.com/secret");

    let outcome = submitter.submit(&url, false).await.expect("submit failed");
    assert_eq!(
        outcome,
        SubmitOutcome::Abandoned(Fault::Hard {
            status: 401,
            body: "bad keys".to_string()
        })
    );
    assert!(store.job_id(&url).await.is_none());
}

#[tokio::test]
async fn test_not_found_is_abandoned_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, _store, _temp_dir) = setup_submitter(&config);

    let outcome = submitter
        .submit(&canonicalize("https://example.com/gone"), false)
        .await
        .expect("submit failed");
    assert!(matches!(
        outcome,
        SubmitOutcome::Abandoned(Fault::Hard { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_transient_fault_retries_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, _store, _temp_dir) = setup_submitter(&config);

    let outcome = submitter
        .submit(&canonicalize("https://example.com/flaky"), false)
        .await
        .expect("submit failed");
    assert_eq!(
        outcome,
        SubmitOutcome::Abandoned(Fault::TransientExhausted {
            status: 503,
            attempts: config.max_transient_retries + 1
        })
    );

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), config.max_transient_retries as usize + 1);
}

#[tokio::test]
async fn test_transient_fault_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "J2"})))
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, _store, _temp_dir) = setup_submitter(&config);

    let outcome = submitter
        .submit(&canonicalize("https://example.com/flaky"), false)
        .await
        .expect("submit failed");
    assert!(matches!(
        outcome,
        SubmitOutcome::Accepted(ref handle) if handle.job_id == "J2"
    ));
}

#[tokio::test]
async fn test_success_without_job_id_is_abandoned() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "message": "Cannot resolve host"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, store, temp_dir) = setup_submitter(&config);
    let url = canonicalize("https://nope.invalid/");

    let outcome = submitter.submit(&url, false).await.expect("submit failed");
    assert!(matches!(
        outcome,
        SubmitOutcome::Abandoned(Fault::Protocol { ref body, .. }) if body.contains("Cannot resolve host")
    ));
    assert!(store.job_id(&url).await.is_none());
    let contents = std::fs::read_to_string(temp_dir.path().join("job_ids.csv")).unwrap();
    assert!(contents.is_empty());
}

#[tokio::test]
async fn test_resubmit_replaces_known_job_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "J-new"})))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (submitter, store, _temp_dir) = setup_submitter(&config);
    let url = canonicalize("https://example.com/stuck");
    store.record_job_id(&url, "J-old").await.unwrap();

    let outcome = submitter.resubmit(&url, false).await.expect("submit failed");
    assert!(matches!(
        outcome,
        SubmitOutcome::Accepted(ref handle) if handle.job_id == "J-new" && !handle.reused
    ));
    assert_eq!(store.job_id(&url).await.as_deref(), Some("J-new"));
}

#[tokio::test]
async fn test_shutdown_interrupts_rate_limit_wait() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save/"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let config = Config {
        submit_initial_wait: Duration::from_secs(3600),
        submit_max_wait: Duration::from_secs(3600),
        ..create_test_config(&server)
    };
    let temp_dir = TempDir::new().unwrap();
    let store = StateStore::open(
        &temp_dir.path().join("job_ids.csv"),
        &temp_dir.path().join("wayback_urls.csv"),
        Duration::from_secs(3600),
        Utc::now(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let submitter = Submitter::new(
        Arc::new(WaybackClient::new(&config).unwrap()),
        Arc::new(store),
        config,
        shutdown.clone(),
    );

    let url = canonicalize("https://example.com/busy");
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(10), submitter.submit(&url, false))
        .await
        .expect("shutdown did not interrupt the wait");
    assert!(matches!(
        result,
        Err(serp_wayback_archiver::wayback::WaybackError::Cancelled)
    ));
    canceller.await.unwrap();
}
