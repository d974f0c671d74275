//! Integration tests for broker selection
//!
//! These tests verify that:
//! - Automatic selection returns a valid broker from the cached list
//! - Enterprise brokers take precedence over shared ones
//! - All-invalid candidate lists fail with a descriptive error
//! - Explicit broker CIDs are fetched and validated

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use trapflow::broker::select::Prober;
use trapflow::{BrokerSelector, TrapError};
use wiremock::MockServer;

use crate::helpers::{broker_json, instance_json, mount_broker_list, test_cache};

fn fast_prober() -> Prober {
    Prober {
        max_response_time: Duration::from_millis(250),
        retries: 2,
        pause: Duration::from_millis(10),
    }
}

fn selector(cache: Arc<trapflow::BrokerCache>, tags: Vec<String>) -> BrokerSelector {
    BrokerSelector::new(cache, tags, fast_prober())
}

#[tokio::test]
async fn automatic_selection_returns_reachable_broker() {
    let mock_server = MockServer::start().await;
    let addr = mock_server.address();

    // the mock server itself doubles as the reachable broker endpoint
    mount_broker_list(
        &mock_server,
        vec![broker_json(
            "/broker/1",
            "circonus",
            vec![instance_json(
                &addr.ip().to_string(),
                addr.port(),
                "broker1.example.net",
                &["httptrap"],
            )],
        )],
    )
    .await;

    let cache = test_cache(&mock_server);
    cache.ensure_init().await.unwrap();

    let selected = selector(cache, Vec::new())
        .select(None, "httptrap:cua:host:linux")
        .await
        .unwrap();
    assert_eq!(selected.cid, "/broker/1");
}

#[tokio::test]
async fn enterprise_brokers_take_precedence() {
    let mock_server = MockServer::start().await;
    let addr = mock_server.address();
    let ip = addr.ip().to_string();
    let port = addr.port();

    mount_broker_list(
        &mock_server,
        vec![
            broker_json(
                "/broker/1",
                "circonus",
                vec![instance_json(&ip, port, "shared.example.net", &["httptrap"])],
            ),
            broker_json(
                "/broker/2",
                "enterprise",
                vec![instance_json(&ip, port, "dedicated.example.net", &["httptrap"])],
            ),
        ],
    )
    .await;

    let cache = test_cache(&mock_server);
    cache.ensure_init().await.unwrap();
    let selector = selector(cache, Vec::new());

    // random choice must still never pick the shared broker
    for _ in 0..8 {
        let selected = selector.select(None, "httptrap").await.unwrap();
        assert_eq!(selected.cid, "/broker/2");
    }
}

#[tokio::test]
async fn all_invalid_candidates_is_an_error() {
    let mock_server = MockServer::start().await;
    let addr = mock_server.address();

    mount_broker_list(
        &mock_server,
        vec![
            // unknown kind
            broker_json(
                "/broker/1",
                "mystery",
                vec![instance_json(
                    &addr.ip().to_string(),
                    addr.port(),
                    "a.example.net",
                    &["httptrap"],
                )],
            ),
            // wrong capability
            broker_json(
                "/broker/2",
                "circonus",
                vec![instance_json(
                    &addr.ip().to_string(),
                    addr.port(),
                    "b.example.net",
                    &["json", "ping_icmp"],
                )],
            ),
            // no instances at all
            broker_json("/broker/3", "circonus", vec![]),
        ],
    )
    .await;

    let cache = test_cache(&mock_server);
    cache.ensure_init().await.unwrap();

    let err = selector(cache, Vec::new())
        .select(None, "httptrap")
        .await
        .unwrap_err();
    assert_matches!(err, TrapError::NoValidBroker(msg) => {
        assert!(msg.contains("zero are valid"), "unexpected message: {msg}");
    });
}

#[tokio::test]
async fn unreachable_instance_fails_validation() {
    let mock_server = MockServer::start().await;

    // TEST-NET address, nothing listens there
    mount_broker_list(
        &mock_server,
        vec![broker_json(
            "/broker/1",
            "circonus",
            vec![instance_json("192.0.2.10", 43191, "dark.example.net", &["httptrap"])],
        )],
    )
    .await;

    let cache = test_cache(&mock_server);
    cache.ensure_init().await.unwrap();

    let err = selector(cache, Vec::new())
        .select(None, "httptrap")
        .await
        .unwrap_err();
    assert_matches!(err, TrapError::NoValidBroker(_));
}

#[tokio::test]
async fn explicit_cid_is_fetched_and_validated() {
    let mock_server = MockServer::start().await;
    let addr = mock_server.address();

    mount_broker_list(
        &mock_server,
        vec![
            broker_json(
                "/broker/1",
                "circonus",
                vec![instance_json(
                    &addr.ip().to_string(),
                    addr.port(),
                    "one.example.net",
                    &["httptrap"],
                )],
            ),
            broker_json(
                "/broker/2",
                "circonus",
                vec![instance_json(
                    &addr.ip().to_string(),
                    addr.port(),
                    "two.example.net",
                    &["json"],
                )],
            ),
        ],
    )
    .await;

    let cache = test_cache(&mock_server);
    let selector = selector(cache, Vec::new());

    // cache self-populates on get()
    let broker = selector.select(Some("/broker/1"), "httptrap").await.unwrap();
    assert_eq!(broker.cid, "/broker/1");

    // present in the cache but does not support the check type
    let err = selector
        .select(Some("/broker/2"), "httptrap")
        .await
        .unwrap_err();
    assert_matches!(err, TrapError::NoValidBroker(_));

    let err = selector
        .select(Some("/broker/99"), "httptrap")
        .await
        .unwrap_err();
    assert_matches!(err, TrapError::BrokerNotFound(_));
}

#[tokio::test]
async fn select_tags_narrow_the_candidate_list() {
    let mock_server = MockServer::start().await;
    let addr = mock_server.address();
    let ip = addr.ip().to_string();
    let port = addr.port();

    let mut east = broker_json(
        "/broker/1",
        "circonus",
        vec![instance_json(&ip, port, "east.example.net", &["httptrap"])],
    );
    east["_tags"] = serde_json::json!(["datacenter:east"]);
    let mut west = broker_json(
        "/broker/2",
        "circonus",
        vec![instance_json(&ip, port, "west.example.net", &["httptrap"])],
    );
    west["_tags"] = serde_json::json!(["datacenter:west"]);

    mount_broker_list(&mock_server, vec![east, west]).await;

    let cache = test_cache(&mock_server);
    cache.ensure_init().await.unwrap();

    let selected = selector(cache, vec!["datacenter:west".to_string()])
        .select(None, "httptrap")
        .await
        .unwrap();
    assert_eq!(selected.cid, "/broker/2");
}
