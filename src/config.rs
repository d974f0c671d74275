use std::sync::Arc;
use std::time::Duration;

use crate::api::CheckBundle;
use crate::error::{TrapError, TrapResult};

pub const DEFAULT_BROKER_MAX_RESPONSE_TIME: &str = "500ms";
pub const DEFAULT_SUBMISSION_TIMEOUT: &str = "10s";

/// Configuration surface for a [`crate::TrapSession`]
///
/// All fields are optional; an all-default config creates an httptrap check
/// with generated defaults on an automatically selected broker.
#[derive(Clone, Default)]
pub struct Config {
    /// Check bundle configuration to find or create the check from,
    /// or `None` for defaults
    pub check: Option<CheckBundle>,

    /// Explicit submission URL (e.g. submitting to an agent); when set the
    /// check is never resolved or refreshed through the API
    pub submission_url: Option<String>,

    /// Timeout for submitting metrics to a broker (humantime string, default 10s)
    pub submission_timeout: Option<String>,

    /// Time a broker instance must answer a reachability probe within
    /// (humantime string, default 500ms)
    pub broker_max_response_time: Option<String>,

    /// Path to write traced metric payloads to, or `-` to route them
    /// through the logger
    pub trace_metrics: Option<String>,

    /// Tags a broker must carry to be eligible for automatic selection
    pub broker_select_tags: Vec<String>,

    /// Tags used when searching for an existing check
    pub check_search_tags: Vec<String>,

    /// Caller-supplied TLS configuration, used verbatim for submission
    pub submit_tls: Option<Arc<rustls::ClientConfig>>,

    /// The broker fronting the submission URL uses a publicly trusted
    /// certificate; skip CN pinning and defer to the system trust store
    pub public_ca: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("check", &self.check)
            .field("submission_url", &self.submission_url)
            .field("submission_timeout", &self.submission_timeout)
            .field("broker_max_response_time", &self.broker_max_response_time)
            .field("trace_metrics", &self.trace_metrics)
            .field("broker_select_tags", &self.broker_select_tags)
            .field("check_search_tags", &self.check_search_tags)
            .field("submit_tls", &self.submit_tls.is_some())
            .field("public_ca", &self.public_ca)
            .finish()
    }
}

/// Parse an optional humantime duration, falling back to a default literal
pub(crate) fn parse_duration(value: Option<&str>, default: &str, what: &str) -> TrapResult<Duration> {
    let raw = match value {
        Some(v) if !v.is_empty() => v,
        _ => default,
    };
    humantime::parse_duration(raw)
        .map_err(|e| TrapError::Config(format!("parsing {} ({}): {}", what, raw, e)))
}
