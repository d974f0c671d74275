//! Broker selection and validation
//!
//! Picks one broker usable for a given check type: either the caller pinned
//! one explicitly, or one is chosen automatically from the cache after
//! health, capability, and reachability filtering.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::api::{Broker, BrokerInstance, BrokerKind};
use crate::broker::BrokerCache;
use crate::error::{TrapError, TrapResult};

const DEFAULT_BROKER_PORT: u16 = 43191;

/// Public vendor ingestion hostnames that always terminate TLS on 443,
/// regardless of the port advertised in broker metadata
const FORCED_TLS_PORT_HOSTS: [&str; 2] = ["trap.noit.circonus.net", "api.circonus.net"];

/// TCP reachability probe settings. Production defaults; tests shrink the
/// retry pause.
#[derive(Debug, Clone)]
pub struct Prober {
    pub max_response_time: Duration,
    pub retries: u32,
    pub pause: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            max_response_time: Duration::from_millis(500),
            retries: 5,
            pause: Duration::from_secs(2),
        }
    }
}

impl Prober {
    /// Probe `host:port`, retrying with a fixed pause between attempts
    async fn reachable(&self, host: &str, port: u16, who: &str) -> bool {
        let target = format!("{}:{}", host, port);
        for attempt in 1..=self.retries {
            match tokio::time::timeout(self.max_response_time, TcpStream::connect(&target)).await {
                Ok(Ok(_conn)) => {
                    debug!(broker = who, target, "broker instance is reachable");
                    return true;
                }
                Ok(Err(e)) => {
                    debug!(
                        broker = who,
                        target,
                        error = %e,
                        attempt,
                        retries = self.retries,
                        "unable to connect, retrying"
                    );
                }
                Err(_) => {
                    debug!(
                        broker = who,
                        target,
                        attempt,
                        retries = self.retries,
                        "connect timed out, retrying"
                    );
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(self.pause).await;
            }
        }
        false
    }
}

/// Resolve the host/port an instance should be probed (and submitted to) at.
/// External host takes priority over bare IP; external port over internal.
pub(crate) fn instance_target(instance: &BrokerInstance) -> Option<(String, u16)> {
    let host = instance
        .external_host
        .as_deref()
        .filter(|h| !h.is_empty())
        .or(instance.ip.as_deref().filter(|ip| !ip.is_empty()))?
        .to_string();

    let mut port = instance
        .external_port
        .filter(|p| *p != 0)
        .or(instance.port.filter(|p| *p != 0))
        .unwrap_or(DEFAULT_BROKER_PORT);

    if FORCED_TLS_PORT_HOSTS.contains(&host.as_str()) {
        port = 443;
    }

    Some((host, port))
}

/// Does the instance advertise a module for the check's base type?
/// The base type is the segment before the first `:` in a dotted type
/// string, e.g. "httptrap" for "httptrap:cua:host:linux".
pub(crate) fn supports_check_type(check_type: &str, instance: &BrokerInstance) -> TrapResult<()> {
    if check_type.is_empty() {
        return Err(TrapError::Config("invalid check type (empty)".to_string()));
    }

    let base_type = check_type.split(':').next().unwrap_or(check_type);

    if instance.modules.iter().any(|m| m == base_type) {
        return Ok(());
    }

    Err(TrapError::NoValidBroker(format!(
        "check type '{}' not found in broker modules ({})",
        base_type,
        instance.modules.join(",")
    )))
}

/// Chooses a healthy, capability-matching broker from the shared cache
pub struct BrokerSelector {
    cache: Arc<BrokerCache>,
    select_tags: Vec<String>,
    prober: Prober,
}

impl std::fmt::Debug for BrokerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSelector")
            .field("select_tags", &self.select_tags)
            .field("prober", &self.prober)
            .finish_non_exhaustive()
    }
}

impl BrokerSelector {
    pub fn new(cache: Arc<BrokerCache>, select_tags: Vec<String>, prober: Prober) -> Self {
        Self {
            cache,
            select_tags,
            prober,
        }
    }

    /// Fetch a specific broker by CID and validate it for the check type
    pub async fn fetch(&self, cid: &str, check_type: &str) -> TrapResult<Broker> {
        if cid.is_empty() {
            return Err(TrapError::Config("invalid broker cid (empty)".to_string()));
        }
        if check_type.is_empty() {
            return Err(TrapError::Config("invalid check type (empty)".to_string()));
        }
        let broker = self.cache.get(cid).await.map_err(|e| match e {
            TrapError::BrokerNotFound(_) => e,
            other => TrapError::Api(format!("retrieving broker ({}): {}", cid, other)),
        })?;
        self.is_valid_broker(&broker, check_type).await.map_err(|e| {
            TrapError::NoValidBroker(format!(
                "{} ({}) is an invalid broker for check type {}: {}",
                broker.name, cid, check_type, e
            ))
        })?;
        Ok(broker)
    }

    /// Pick one broker for the check type: the explicitly configured one, or
    /// an automatic choice among the valid candidates. When any valid
    /// candidate is enterprise-kind, non-enterprise candidates are dropped
    /// (a dedicated deployment takes precedence over shared brokers).
    pub async fn select(&self, explicit_cid: Option<&str>, check_type: &str) -> TrapResult<Broker> {
        if let Some(cid) = explicit_cid {
            return self.fetch(cid, check_type).await;
        }

        let list = if self.select_tags.is_empty() {
            self.cache.list().await?
        } else {
            self.cache.search(&self.select_tags).await?
        };

        if list.is_empty() {
            return Err(TrapError::NoValidBroker("zero brokers found".to_string()));
        }

        let mut valid: Vec<Broker> = Vec::with_capacity(list.len());
        let mut have_enterprise = false;
        let total = list.len();

        for broker in list {
            match self.is_valid_broker(&broker, check_type).await {
                Ok(()) => {
                    if broker.kind == BrokerKind::Enterprise {
                        have_enterprise = true;
                    }
                    valid.push(broker);
                }
                Err(e) => {
                    debug!(broker = %broker.name, error = %e, "skipping invalid broker");
                }
            }
        }

        if have_enterprise {
            valid.retain(|b| b.kind == BrokerKind::Enterprise);
        }

        if valid.is_empty() {
            return Err(TrapError::NoValidBroker(format!(
                "found {} broker(s), zero are valid",
                total
            )));
        }

        // crypto-strong random draw over the ordered candidate list
        let idx = rand::rngs::OsRng.gen_range(0..valid.len());
        let selected = valid.swap_remove(idx);
        info!(broker = %selected.name, "selected broker");
        Ok(selected)
    }

    /// A broker is valid if its kind is known, it has instances, and at
    /// least one active instance supports the check type, has a resolvable
    /// target, and answers a TCP probe. For httptrap checks behind an
    /// HTTP(S) proxy the probe is skipped; direct-connect probing is
    /// meaningless through a proxy.
    pub async fn is_valid_broker(&self, broker: &Broker, check_type: &str) -> TrapResult<()> {
        match broker.kind {
            BrokerKind::Circonus | BrokerKind::Enterprise => {}
            BrokerKind::Unknown(ref kind) => {
                return Err(TrapError::NoValidBroker(format!(
                    "broker '{}' has unknown type ({})",
                    broker.name, kind
                )));
            }
        }

        if broker.details.is_empty() {
            return Err(TrapError::NoValidBroker(format!(
                "broker '{}' invalid, no instance details",
                broker.name
            )));
        }

        let http_proxy = std::env::var("HTTP_PROXY").unwrap_or_default();
        let https_proxy = std::env::var("HTTPS_PROXY").unwrap_or_default();

        for instance in &broker.details {
            if !instance.is_active() {
                debug!(
                    broker = %broker.name,
                    instance = %instance.cn,
                    status = %instance.status,
                    "skipping inactive broker instance"
                );
                continue;
            }

            if let Err(e) = supports_check_type(check_type, instance) {
                debug!(
                    broker = %broker.name,
                    instance = %instance.cn,
                    error = %e,
                    "skipping, instance does not support check type"
                );
                continue;
            }

            let Some((host, port)) = instance_target(instance) else {
                debug!(
                    broker = %broker.name,
                    instance = %instance.cn,
                    "skipping, no IP or external host set"
                );
                continue;
            };

            if check_type.to_lowercase().contains("httptrap")
                && (!http_proxy.is_empty() || !https_proxy.is_empty())
            {
                debug!(
                    http_proxy,
                    https_proxy, "skipping connection test, proxy environment var(s) set"
                );
                return Ok(());
            }

            if self.prober.reachable(&host, port, &broker.name).await {
                return Ok(());
            }
        }

        Err(TrapError::NoValidBroker(
            "no valid broker instances found".to_string(),
        ))
    }
}
