//! Monitoring API boundary
//!
//! The pipeline talks to the monitoring service through the [`ApiClient`]
//! trait; a thin reqwest-backed [`RestClient`] is provided for production use,
//! and tests substitute their own implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TrapError, TrapResult};

pub const STATUS_ACTIVE: &str = "active";

/// Broker deployment kind, from the API's `_type` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Vendor-operated shared broker
    Circonus,
    /// Customer-operated dedicated broker
    Enterprise,
    #[serde(untagged)]
    Unknown(String),
}

/// One ingestion endpoint fronting the monitoring service.
/// Immutable snapshot once fetched; refreshed wholesale, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broker {
    #[serde(rename = "_cid")]
    pub cid: String,
    #[serde(rename = "_name")]
    pub name: String,
    #[serde(rename = "_type")]
    pub kind: BrokerKind,
    #[serde(rename = "_details")]
    pub details: Vec<BrokerInstance>,
    #[serde(rename = "_tags", default)]
    pub tags: Vec<String>,
}

/// A single instance of a broker cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInstance {
    pub status: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(rename = "ipaddress", default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub external_host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub external_port: Option<u16>,
    pub cn: String,
}

impl BrokerInstance {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

/// The logical check resource binding a metric stream to a broker,
/// including its submission URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckBundle {
    #[serde(rename = "_cid", default)]
    pub cid: String,
    #[serde(rename = "_check_uuids", default)]
    pub check_uuids: Vec<String>,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type", default)]
    pub check_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metric_filters: Vec<Vec<String>>,
    #[serde(default)]
    pub metrics: Vec<serde_json::Value>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub timeout: f64,
}

/// Check bundle config key holding the submission URL
pub const CONFIG_SUBMISSION_URL: &str = "submission_url";
/// Check bundle config key enabling asynchronous metric ingestion
pub const CONFIG_ASYNC_METRICS: &str = "asynch_metrics";
/// Check bundle config key holding the submission secret
pub const CONFIG_SECRET: &str = "secret";

impl CheckBundle {
    pub fn submission_url(&self) -> Option<&String> {
        self.config.get(CONFIG_SUBMISSION_URL)
    }
}

/// Authenticated access to the monitoring API. Only the handful of calls the
/// pipeline needs; the API's full surface is out of scope.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Generic GET, used exclusively for `/pki/ca.crt`
    async fn get(&self, path: &str) -> TrapResult<Vec<u8>>;

    async fn fetch_broker(&self, cid: &str) -> TrapResult<Broker>;
    async fn fetch_brokers(&self) -> TrapResult<Vec<Broker>>;
    async fn search_brokers(&self, criteria: &str) -> TrapResult<Vec<Broker>>;

    async fn fetch_check_bundle(&self, cid: &str) -> TrapResult<CheckBundle>;
    async fn create_check_bundle(&self, cfg: &CheckBundle) -> TrapResult<CheckBundle>;
    async fn search_check_bundles(&self, criteria: &str) -> TrapResult<Vec<CheckBundle>>;
    async fn update_check_bundle(&self, cfg: &CheckBundle) -> TrapResult<CheckBundle>;
}

/// reqwest-backed [`ApiClient`] speaking the monitoring service's REST API
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    app: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, app: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app: app.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("X-Circonus-Auth-Token", &self.token)
            .header("X-Circonus-App-Name", &self.app)
            .header("Accept", "application/json")
    }

    async fn read_response(&self, response: reqwest::Response) -> TrapResult<Vec<u8>> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TrapError::Api(format!("reading response body: {}", e)))?;
        if !status.is_success() {
            return Err(TrapError::Api(format!(
                "api request failed ({}): {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(body.to_vec())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> TrapResult<T> {
        let body = self.get(path).await?;
        serde_json::from_slice(&body).map_err(|e| {
            TrapError::Api(format!("parsing api response ({}): {}", path, e))
        })
    }
}

#[async_trait]
impl ApiClient for RestClient {
    async fn get(&self, path: &str) -> TrapResult<Vec<u8>> {
        debug!(path, "api GET");
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| TrapError::Api(format!("GET {}: {}", path, e)))?;
        self.read_response(response).await
    }

    async fn fetch_broker(&self, cid: &str) -> TrapResult<Broker> {
        self.get_json(cid).await
    }

    async fn fetch_brokers(&self) -> TrapResult<Vec<Broker>> {
        self.get_json("/broker").await
    }

    async fn search_brokers(&self, criteria: &str) -> TrapResult<Vec<Broker>> {
        let path = format!("/broker?search={}", criteria);
        self.get_json(&path).await
    }

    async fn fetch_check_bundle(&self, cid: &str) -> TrapResult<CheckBundle> {
        self.get_json(cid).await
    }

    async fn create_check_bundle(&self, cfg: &CheckBundle) -> TrapResult<CheckBundle> {
        debug!(target = %cfg.target, "api create check bundle");
        let response = self
            .request(reqwest::Method::POST, "/check_bundle")
            .json(cfg)
            .send()
            .await
            .map_err(|e| TrapError::Api(format!("POST /check_bundle: {}", e)))?;
        let body = self.read_response(response).await?;
        serde_json::from_slice(&body)
            .map_err(|e| TrapError::Api(format!("parsing created check bundle: {}", e)))
    }

    async fn search_check_bundles(&self, criteria: &str) -> TrapResult<Vec<CheckBundle>> {
        let path = format!("/check_bundle?search={}", criteria);
        self.get_json(&path).await
    }

    async fn update_check_bundle(&self, cfg: &CheckBundle) -> TrapResult<CheckBundle> {
        debug!(cid = %cfg.cid, "api update check bundle");
        let response = self
            .request(reqwest::Method::PUT, &cfg.cid)
            .json(cfg)
            .send()
            .await
            .map_err(|e| TrapError::Api(format!("PUT {}: {}", cfg.cid, e)))?;
        let body = self.read_response(response).await?;
        serde_json::from_slice(&body)
            .map_err(|e| TrapError::Api(format!("parsing updated check bundle: {}", e)))
    }
}
