//! Process-wide broker list cache
//!
//! Single source of truth for "what brokers exist", shared across all
//! concurrent check sessions to avoid redundant API calls. One lock guards
//! every read and write; the lock is held across the network fetch only for
//! the initial/forced refresh, which by definition must block until the API
//! answers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::api::{ApiClient, Broker};
use crate::error::{TrapError, TrapResult};

/// Default refresh TTL; refreshes more frequent than this are suppressed
/// to prevent API request storms under repeated selection pressure
pub const REFRESH_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct CacheState {
    last_refresh: Option<Instant>,
    brokers: Option<Vec<Broker>>,
}

/// Mutex-guarded cache of the full broker list
///
/// Constructed explicitly and shared via [`Arc`]; sessions sharing one cache
/// across threads is the supported concurrency model.
pub struct BrokerCache {
    client: Arc<dyn ApiClient>,
    refresh_ttl: Duration,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for BrokerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCache").finish_non_exhaustive()
    }
}

impl BrokerCache {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self::with_refresh_ttl(client, REFRESH_TTL)
    }

    /// Cache with a custom refresh TTL
    pub fn with_refresh_ttl(client: Arc<dyn ApiClient>, refresh_ttl: Duration) -> Self {
        Self {
            client,
            refresh_ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Idempotent initialization: the first caller performs the initial
    /// fetch, later callers are no-ops once the cache is populated.
    pub async fn ensure_init(&self) -> TrapResult<()> {
        {
            let state = self.state.lock().await;
            if state.brokers.is_some() {
                return Ok(());
            }
        }
        self.fetch_all().await
    }

    /// Unconditional refresh; replaces the snapshot atomically under lock.
    /// The last-refresh timestamp advances only on success.
    pub async fn fetch_all(&self) -> TrapResult<()> {
        let mut state = self.state.lock().await;
        Self::fetch_locked(&self.client, &mut state).await
    }

    async fn fetch_locked(client: &Arc<dyn ApiClient>, state: &mut CacheState) -> TrapResult<()> {
        let list = client
            .fetch_brokers()
            .await
            .map_err(|e| TrapError::Api(format!("error fetching broker list: {}", e)))?;
        debug!(brokers = list.len(), "refreshed broker list");
        state.brokers = Some(list);
        state.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Refresh only if the TTL has elapsed since the last successful fetch
    pub async fn refresh_if_stale(&self) -> TrapResult<()> {
        let stale = {
            let state = self.state.lock().await;
            match state.last_refresh {
                Some(at) => at.elapsed() > self.refresh_ttl,
                None => true,
            }
        };
        if stale {
            return self.fetch_all().await;
        }
        Ok(())
    }

    /// Current snapshot. Never-populated and populated-but-empty are both
    /// invalid states, reported distinctly rather than as a silent empty list.
    pub async fn list(&self) -> TrapResult<Vec<Broker>> {
        let state = self.state.lock().await;
        match &state.brokers {
            None => Err(TrapError::InvalidState(
                "broker list not initialized".to_string(),
            )),
            Some(list) if list.is_empty() => Err(TrapError::InvalidState(
                "empty broker list".to_string(),
            )),
            Some(list) => Ok(list.clone()),
        }
    }

    /// Linear scan for a broker by CID. An empty snapshot triggers one
    /// synchronous refetch before giving up.
    pub async fn get(&self, cid: &str) -> TrapResult<Broker> {
        if cid.is_empty() {
            return Err(TrapError::Config("invalid broker cid (empty)".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.brokers.as_ref().is_none_or(|l| l.is_empty()) {
            Self::fetch_locked(&self.client, &mut state)
                .await
                .map_err(|e| {
                    TrapError::InvalidState(format!(
                        "broker list empty, unable to fetch broker list: {}",
                        e
                    ))
                })?;
            if state.brokers.as_ref().is_none_or(|l| l.is_empty()) {
                return Err(TrapError::InvalidState("no brokers in list".to_string()));
            }
        }

        state
            .brokers
            .as_ref()
            .and_then(|list| list.iter().find(|b| b.cid == cid).cloned())
            .ok_or_else(|| TrapError::BrokerNotFound(cid.to_string()))
    }

    /// Brokers whose tag set is a superset of the required tags
    /// (case-insensitive exact tag match)
    pub async fn search(&self, required_tags: &[String]) -> TrapResult<Vec<Broker>> {
        let list = self.list().await?;
        Ok(list
            .into_iter()
            .filter(|b| {
                required_tags.iter().all(|want| {
                    b.tags.iter().any(|have| have.eq_ignore_ascii_case(want))
                })
            })
            .collect())
    }
}
