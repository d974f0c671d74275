//! Integration tests for payload submission
//!
//! These tests verify that:
//! - Small payloads go out uncompressed, large ones gzip-compressed
//! - Transient 5xx failures are retried
//! - A 404 triggers a check refresh and exactly one resubmission
//! - A 404 against a caller-pinned submission URL is terminal
//! - The end-to-end find-or-create + select + submit flow works

use std::io::Read;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use trapflow::{CheckBundle, Config, TrapError, TrapSession};
use wiremock::matchers::{body_bytes, header, method, path, query_param_contains};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{broker_json, bundle_json, instance_json, test_api, test_cache};

async fn session_for(
    api_server: &MockServer,
    submission_url: &str,
    cfg: Config,
) -> TrapSession {
    let bundle: CheckBundle =
        serde_json::from_value(bundle_json("/check_bundle/100", "/broker/1", submission_url))
            .unwrap();
    TrapSession::from_check_bundle(test_api(api_server), test_cache(api_server), cfg, bundle)
        .await
        .unwrap()
}

#[tokio::test]
async fn small_payload_is_sent_uncompressed() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;
    let payload = vec![b'x'; 50];

    Mock::given(method("PUT"))
        .and(path("/module/httptrap/check/secret"))
        .and(header("content-type", "application/json"))
        .and(body_bytes(payload.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stats": 1 })))
        .expect(1)
        .mount(&trap)
        .await;

    let url = format!("{}/module/httptrap/check/secret", trap.uri());
    let mut session = session_for(&api, &url, Config::default()).await;

    let result = session.send_metrics(&payload).await.unwrap();
    assert_eq!(result.bytes_sent, 50);
    assert!(!result.compressed);
    assert_eq!(result.error, "none");
    assert_eq!(result.stats, 1);

    // no Content-Encoding header went out
    let requests = trap.received_requests().await.unwrap();
    assert!(requests[0].headers.get("content-encoding").is_none());
}

#[tokio::test]
async fn large_payload_is_gzip_compressed() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;
    let payload = vec![b'y'; 4096];

    Mock::given(method("PUT"))
        .and(path("/module/httptrap/check/secret"))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stats": 1 })))
        .expect(1)
        .mount(&trap)
        .await;

    let url = format!("{}/module/httptrap/check/secret", trap.uri());
    let mut session = session_for(&api, &url, Config::default()).await;

    let result = session.send_metrics(&payload).await.unwrap();
    assert!(result.compressed);
    assert!(result.bytes_sent < payload.len());

    // the wire bytes decompress back to the exact original payload
    let requests = trap.received_requests().await.unwrap();
    let mut decoder = flate2::read::GzDecoder::new(&requests[0].body[..]);
    let mut restored = Vec::new();
    decoder.read_to_end(&mut restored).unwrap();
    assert_eq!(restored, payload);
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/module/httptrap/check/secret"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&trap)
        .await;
    Mock::given(method("PUT"))
        .and(path("/module/httptrap/check/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stats": 4 })))
        .expect(1)
        .mount(&trap)
        .await;

    let url = format!("{}/module/httptrap/check/secret", trap.uri());
    let mut session = session_for(&api, &url, Config::default()).await;

    let result = session.send_metrics(b"{\"m\":{\"_type\":\"n\",\"_value\":1}}").await.unwrap();
    assert_eq!(result.stats, 4);
    assert_eq!(result.error, "none");
}

#[tokio::test]
async fn stale_endpoint_refreshes_check_and_retries_once() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;

    let old_url = format!("{}/module/httptrap/old/secret", trap.uri());
    let new_url = format!("{}/module/httptrap/new/secret", trap.uri());

    // the old endpoint no longer knows the check
    Mock::given(method("PUT"))
        .and(path("/module/httptrap/old/secret"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&trap)
        .await;
    Mock::given(method("PUT"))
        .and(path("/module/httptrap/new/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stats": 2 })))
        .expect(1)
        .mount(&trap)
        .await;

    // refresh hands back the bundle with the relocated submission URL
    Mock::given(method("GET"))
        .and(path("/check_bundle/100"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(bundle_json("/check_bundle/100", "/broker/1", &new_url)),
        )
        .expect(1)
        .mount(&api)
        .await;

    let mut session = session_for(&api, &old_url, Config::default()).await;
    let result = session.send_metrics(b"{}").await.unwrap();
    assert_eq!(result.stats, 2);
    assert_eq!(session.submission_url(), new_url);
}

#[tokio::test]
async fn stale_endpoint_with_pinned_url_is_terminal() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/agent/push"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&trap)
        .await;
    // no refresh attempt may reach the API
    Mock::given(method("GET"))
        .and(path("/check_bundle/100"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&api)
        .await;

    let url = format!("{}/agent/push", trap.uri());
    let cfg = Config {
        submission_url: Some(url.clone()),
        ..Config::default()
    };
    let mut session = session_for(&api, &url, cfg).await;

    let err = session.send_metrics(b"{}").await.unwrap_err();
    assert_matches!(err, TrapError::SubmitFailed { status: 404, .. });
}

#[tokio::test]
async fn empty_payload_is_rejected_without_network() {
    let api = MockServer::start().await;
    let mut session = session_for(&api, "http://127.0.0.1:9/none", Config::default()).await;
    let err = session.send_metrics(b"").await.unwrap_err();
    assert_matches!(err, TrapError::InvalidState(_));
}

#[tokio::test]
async fn empty_error_field_normalizes_to_none_and_explicit_error_passes_through() {
    let trap = MockServer::start().await;
    let api = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/module/httptrap/check/secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "stats": 0, "filtered": 3, "error": "invalid metric" })),
        )
        .mount(&trap)
        .await;

    let url = format!("{}/module/httptrap/check/secret", trap.uri());
    let mut session = session_for(&api, &url, Config::default()).await;

    let result = session.send_metrics(b"{}").await.unwrap();
    assert_eq!(result.error, "invalid metric");
    assert_eq!(result.filtered, 3);
}

/// End-to-end: broker list with one active httptrap-capable instance at a
/// mock endpoint, automatic selection picks it, a check is created against
/// it, and a 50-byte payload lands with no compression.
#[tokio::test]
async fn end_to_end_create_select_submit() {
    let server = MockServer::start().await;
    let addr = *server.address();
    let submission_url = format!("{}/module/httptrap/e2e/secret", server.uri());

    crate::helpers::mount_broker_list(
        &server,
        vec![broker_json(
            "/broker/7",
            "circonus",
            vec![instance_json(
                &addr.ip().to_string(),
                addr.port(),
                "e2e.example.net",
                &["httptrap"],
            )],
        )],
    )
    .await;

    // no existing check matches the search
    Mock::given(method("GET"))
        .and(path("/check_bundle"))
        .and(query_param_contains("search", "httptrap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    // check creation returns the bundle bound to the selected broker
    Mock::given(method("POST"))
        .and(path("/check_bundle"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(bundle_json("/check_bundle/200", "/broker/7", &submission_url)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/module/httptrap/e2e/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stats": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let check = CheckBundle {
        check_type: "httptrap".to_string(),
        target: "e2e-test".to_string(),
        ..CheckBundle::default()
    };
    let cfg = Config {
        check: Some(check),
        check_search_tags: vec!["service:e2e".to_string()],
        ..Config::default()
    };

    let mut session = TrapSession::new(test_api(&server), test_cache(&server), cfg)
        .await
        .unwrap();
    assert!(session.is_new_check_bundle());
    assert_eq!(session.check_bundle().unwrap().brokers, vec!["/broker/7"]);

    let payload = vec![b'z'; 50];
    let result = session.send_metrics(&payload).await.unwrap();
    assert_eq!(result.bytes_sent, 50);
    assert!(!result.compressed);
    assert_eq!(result.error, "none");
}
