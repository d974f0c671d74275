//! Per-check submission session
//!
//! A [`TrapSession`] owns one check's worth of state: the resolved check
//! bundle, the selected broker, and the TLS trust for its submission URL.
//! Sessions are not meant for concurrent submissions against the same
//! session; different sessions sharing one [`BrokerCache`] across tasks is
//! the supported model.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::api::{ApiClient, Broker, CheckBundle};
use crate::broker::select::Prober;
use crate::broker::{BrokerCache, BrokerSelector};
use crate::config::{
    parse_duration, Config, DEFAULT_BROKER_MAX_RESPONSE_TIME, DEFAULT_SUBMISSION_TIMEOUT,
};
use crate::error::{TrapError, TrapResult};
use crate::submit::{SubmissionResult, SubmitStatus, TraceTarget};
use crate::trust::TlsState;

pub struct TrapSession {
    pub(crate) client: Arc<dyn ApiClient>,
    pub(crate) cache: Arc<BrokerCache>,
    pub(crate) selector: BrokerSelector,
    pub(crate) check_config: Option<CheckBundle>,
    pub(crate) check_bundle: Option<CheckBundle>,
    pub(crate) broker: Option<Broker>,
    pub(crate) tls: Option<TlsState>,
    pub(crate) custom_tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) custom_submission_url: Option<String>,
    pub(crate) submission_url: String,
    pub(crate) trace: TraceTarget,
    pub(crate) check_search_tags: Vec<String>,
    pub(crate) submission_timeout: Duration,
    pub(crate) new_check_bundle: bool,
    pub(crate) public_ca: bool,
}

impl std::fmt::Debug for TrapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapSession")
            .field("submission_url", &self.submission_url)
            .field("broker", &self.broker.as_ref().map(|b| &b.cid))
            .field("check_bundle", &self.check_bundle.as_ref().map(|b| &b.cid))
            .field("new_check_bundle", &self.new_check_bundle)
            .finish_non_exhaustive()
    }
}

impl TrapSession {
    /// Create a session, finding or creating the check when no explicit
    /// submission URL pins the endpoint. Establishes TLS trust eagerly so
    /// configuration problems surface here rather than on first submit.
    pub async fn new(
        client: Arc<dyn ApiClient>,
        cache: Arc<BrokerCache>,
        cfg: Config,
    ) -> TrapResult<Self> {
        let mut session = Self::assemble(client, cache, &cfg)?;

        if let Some(url) = &cfg.submission_url {
            // assume a valid bundle was provided in the check config
            session.submission_url = url.clone();
            session.check_bundle = session.check_config.clone();
        } else {
            session.cache.ensure_init().await?;
            session.initialize_check().await?;
            let surl = session
                .check_bundle
                .as_ref()
                .and_then(|b| b.submission_url().cloned())
                .ok_or_else(|| {
                    TrapError::InvalidState(
                        "no submission url found in check bundle config".to_string(),
                    )
                })?;
            session.submission_url = surl;
        }

        session.ensure_tls().await?;
        Ok(session)
    }

    /// Create a session over an already-resolved check bundle; no
    /// find-or-create round trips
    pub async fn from_check_bundle(
        client: Arc<dyn ApiClient>,
        cache: Arc<BrokerCache>,
        cfg: Config,
        bundle: CheckBundle,
    ) -> TrapResult<Self> {
        if !bundle.check_type.is_empty() && !bundle.check_type.starts_with("httptrap") {
            return Err(TrapError::Config(format!(
                "check type must be httptrap variant ({})",
                bundle.check_type
            )));
        }

        let mut session = Self::assemble(client, cache, &cfg)?;

        let surl = bundle.submission_url().cloned().ok_or_else(|| {
            TrapError::Config("invalid check bundle, no submission url found".to_string())
        })?;
        session.submission_url = surl;
        session.check_bundle = Some(bundle);

        session.ensure_tls().await?;
        Ok(session)
    }

    fn assemble(
        client: Arc<dyn ApiClient>,
        cache: Arc<BrokerCache>,
        cfg: &Config,
    ) -> TrapResult<Self> {
        if let Some(check) = &cfg.check {
            // this pipeline only deals with httptraps
            if !check.check_type.is_empty() && !check.check_type.starts_with("httptrap") {
                return Err(TrapError::Config(format!(
                    "check type must be httptrap variant ({})",
                    check.check_type
                )));
            }
        }

        let broker_max_response_time = parse_duration(
            cfg.broker_max_response_time.as_deref(),
            DEFAULT_BROKER_MAX_RESPONSE_TIME,
            "broker max response time",
        )?;
        let submission_timeout = parse_duration(
            cfg.submission_timeout.as_deref(),
            DEFAULT_SUBMISSION_TIMEOUT,
            "submission timeout",
        )?;

        let prober = Prober {
            max_response_time: broker_max_response_time,
            ..Prober::default()
        };
        let selector = BrokerSelector::new(cache.clone(), cfg.broker_select_tags.clone(), prober);

        let trace = match cfg.trace_metrics.as_deref() {
            None => TraceTarget::Off,
            Some(path) => match trace_target(path) {
                Ok(target) => target,
                Err(e) => {
                    warn!(path, error = %e, "trace metrics directory, disabling");
                    TraceTarget::Off
                }
            },
        };

        let custom_tls = if cfg.public_ca {
            None
        } else {
            cfg.submit_tls.clone()
        };

        Ok(Self {
            client,
            cache,
            selector,
            check_config: cfg.check.clone(),
            check_bundle: None,
            broker: None,
            tls: None,
            custom_tls,
            custom_submission_url: cfg.submission_url.clone(),
            submission_url: String::new(),
            trace,
            check_search_tags: cfg.check_search_tags.clone(),
            submission_timeout,
            new_check_bundle: false,
            public_ca: cfg.public_ca,
        })
    }

    /// Submit a metric payload to the broker. The payload is opaque bytes;
    /// for an httptrap check it must be the JSON the broker expects.
    ///
    /// On a stale-endpoint classification the check is refreshed once and the
    /// submission retried exactly once; the caller owns durability beyond
    /// that. Dropping the returned future aborts the in-flight HTTP attempt.
    #[instrument(skip(self, metrics))]
    pub async fn send_metrics(&mut self, metrics: &[u8]) -> TrapResult<SubmissionResult> {
        if metrics.is_empty() {
            return Err(TrapError::InvalidState("no metrics to submit".to_string()));
        }

        match self.submit(metrics).await? {
            SubmitStatus::Delivered(result) => Ok(result),
            SubmitStatus::StaleEndpoint(submit_err) => {
                // check moved to a different broker, etc.
                if !self.refresh_check().await? {
                    return Err(TrapError::InvalidState(format!(
                        "unable to refresh: {}",
                        submit_err
                    )));
                }
                let delay = Duration::from_secs(2);
                warn!(delay = ?delay, "check refreshed, retrying submission");
                tokio::time::sleep(delay).await;

                match self.submit(metrics).await? {
                    SubmitStatus::Delivered(result) => Ok(result),
                    // one refresh, one retry; a second 404 is terminal
                    SubmitStatus::StaleEndpoint(e) => Err(e),
                }
            }
        }
    }

    /// True if the session created its check bundle (vs found or given one)
    pub fn is_new_check_bundle(&self) -> bool {
        self.new_check_bundle
    }

    /// The check bundle currently in use. Callers can persist its CID to
    /// re-use the check quickly via the check config on a later run.
    pub fn check_bundle(&self) -> TrapResult<CheckBundle> {
        self.check_bundle
            .clone()
            .ok_or_else(|| TrapError::InvalidState("check not initialized/created".to_string()))
    }

    /// The submission URL the session delivers to
    pub fn submission_url(&self) -> &str {
        &self.submission_url
    }

    /// Pull a fresh copy of the check bundle from the API, resetting broker
    /// and TLS trust
    pub async fn refresh_check_bundle(&mut self) -> TrapResult<CheckBundle> {
        if !self.refresh_check().await? {
            return Err(TrapError::InvalidState(format!(
                "check bundle could not be refreshed - using custom submission URL {}",
                self.custom_submission_url.as_deref().unwrap_or_default()
            )));
        }
        self.check_bundle()
    }

    /// The current pinned TLS config, for pre-seeding further sessions
    /// without re-fetching the CA cert. `None` for public-CA endpoints.
    pub fn broker_tls_config(&self) -> TrapResult<Option<Arc<rustls::ClientConfig>>> {
        match &self.tls {
            Some(state) => Ok(state.client_config()),
            None => Err(TrapError::InvalidState(
                "tls config has not been initialized".to_string(),
            )),
        }
    }

    /// Change metric tracing dynamically; empty string disables it. Returns
    /// the previous setting. On error the current setting is unchanged.
    pub fn set_trace(&mut self, trace: &str) -> TrapResult<TraceSetting> {
        let previous = self.trace_setting();
        if trace.is_empty() {
            self.trace = TraceTarget::Off;
            return Ok(previous);
        }
        self.trace = trace_target(trace)?;
        Ok(previous)
    }

    fn trace_setting(&self) -> TraceSetting {
        match &self.trace {
            TraceTarget::Off => TraceSetting::Off,
            TraceTarget::Log => TraceSetting::Log,
            TraceTarget::Dir(dir) => TraceSetting::Dir(dir.clone()),
        }
    }

    pub(crate) fn tls_client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.tls.as_ref().and_then(|state| state.client_config())
    }

    pub(crate) fn tls_name_mismatch(&self) -> bool {
        self.tls.as_ref().is_some_and(|state| state.name_mismatch())
    }
}

/// Public view of the session's trace destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceSetting {
    Off,
    Log,
    Dir(std::path::PathBuf),
}

/// Validate a trace destination: `-` routes payloads through the logger,
/// anything else must be an existing writable directory
fn trace_target(path: &str) -> TrapResult<TraceTarget> {
    if path.is_empty() {
        return Err(TrapError::Config("invalid trace setting (empty)".to_string()));
    }
    if path == "-" {
        return Ok(TraceTarget::Log);
    }

    let dir = std::path::Path::new(path);
    let meta = std::fs::metadata(dir)
        .map_err(|e| TrapError::Config(format!("unable to stat ({}): {}", path, e)))?;
    if !meta.is_dir() {
        return Err(TrapError::Config(format!("not a directory ({})", path)));
    }

    let probe = dir.join(format!(".wtest-{}", Uuid::new_v4()));
    std::fs::write(&probe, b"")
        .map_err(|e| TrapError::Config(format!("unable to write to ({}): {}", path, e)))?;
    let _ = std::fs::remove_file(&probe);

    Ok(TraceTarget::Dir(dir.to_path_buf()))
}
