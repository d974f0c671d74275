//! Helper functions for integration tests

use std::sync::Arc;

use serde_json::json;
use trapflow::{ApiClient, BrokerCache, RestClient};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// API client pointed at a mock server
pub fn test_api(server: &MockServer) -> Arc<dyn ApiClient> {
    Arc::new(RestClient::new(server.uri(), "trapflow-tests", "test-token"))
}

pub fn test_cache(server: &MockServer) -> Arc<BrokerCache> {
    Arc::new(BrokerCache::new(test_api(server)))
}

/// JSON for one broker as the API reports it
pub fn broker_json(cid: &str, kind: &str, instances: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "_cid": cid,
        "_name": format!("test broker {cid}"),
        "_type": kind,
        "_tags": [],
        "_details": instances,
    })
}

/// JSON for one active broker instance listening on `ip:port`
pub fn instance_json(ip: &str, port: u16, cn: &str, modules: &[&str]) -> serde_json::Value {
    json!({
        "status": "active",
        "modules": modules,
        "ipaddress": ip,
        "external_host": null,
        "port": port,
        "cn": cn,
    })
}

/// JSON for a check bundle with a submission URL
pub fn bundle_json(cid: &str, broker_cid: &str, submission_url: &str) -> serde_json::Value {
    json!({
        "_cid": cid,
        "_check_uuids": ["a0b1c2d3-0000-0000-0000-000000000001"],
        "brokers": [broker_cid],
        "type": "httptrap",
        "status": "active",
        "display_name": "test check",
        "target": "test-target",
        "tags": ["service:test"],
        "config": { "submission_url": submission_url },
        "period": 60,
        "timeout": 10.0,
    })
}

/// Mount a `/broker` list response on the mock API
pub async fn mount_broker_list(server: &MockServer, brokers: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/broker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(brokers))
        .mount(server)
        .await;
}

/// Mount a `/pki/ca.crt` envelope response holding PEM text
pub async fn mount_ca_cert(server: &MockServer, pem: &str) {
    Mock::given(method("GET"))
        .and(path("/pki/ca.crt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "contents": pem })))
        .mount(server)
        .await;
}
