//! Metric payload delivery
//!
//! One call = one delivery: ensure TLS, optionally gzip, optionally trace,
//! PUT with bounded retry/backoff, classify the outcome. Each call builds a
//! fresh single-use HTTP client; connections are not reused across calls.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{
    ACCEPT, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TrapError, TrapResult};
use crate::session::TrapSession;

/// Payloads above this many bytes are gzip-compressed before send
pub const COMPRESSION_THRESHOLD: usize = 1024;

const TRACE_TS_FORMAT: &str = "%Y%m%d_%H%M%S%.9f";

const USER_AGENT_STRING: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Outcome of one delivery
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionResult {
    /// Server-reported error, or the literal "none" (absence-of-error is an
    /// explicit signal, not an omitted field)
    #[serde(default)]
    pub error: String,
    /// Metrics the broker accepted
    #[serde(default)]
    pub stats: u64,
    /// Metrics the broker filtered out
    #[serde(default)]
    pub filtered: u64,
    /// UUID of the check the metrics landed on
    #[serde(skip)]
    pub check_uuid: String,
    /// Correlation identifier for trace files, or "n/a"
    #[serde(skip)]
    pub submit_uuid: String,
    /// Elapsed time for the whole submission call
    #[serde(skip)]
    pub submit_duration: Duration,
    /// Elapsed time of the final HTTP round trip
    #[serde(skip)]
    pub last_req_duration: Duration,
    /// Bytes put on the wire (post-compression)
    #[serde(skip)]
    pub bytes_sent: usize,
    /// Whether the payload was gzip-compressed
    #[serde(skip)]
    pub compressed: bool,
}

/// Classification of a finished submission attempt
#[derive(Debug)]
pub(crate) enum SubmitStatus {
    Delivered(SubmissionResult),
    /// The check's broker binding is stale (404 without a pinned submission
    /// URL); the caller should refresh the check and retry once
    StaleEndpoint(TrapError),
}

/// Where traced payloads go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum TraceTarget {
    #[default]
    Off,
    /// `-`: payloads routed through the logger
    Log,
    Dir(PathBuf),
}

/// What one attempt produced, as seen by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Dial/handshake/IO failure
    TransportError,
    /// HTTP response status
    Status(u16),
}

/// The policy's verdict for an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    Stop,
}

/// Bounded retry with exponential backoff. Pure decision function; the
/// caller owns the sleep and the attempt counter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            wait_min: Duration::from_millis(50),
            wait_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Decide whether attempt `attempt` (1-based) should be followed by
    /// another, and how long to wait first. Transport errors and
    /// 5xx/429 responses are retryable; everything else is terminal.
    pub fn decide(&self, attempt: u32, outcome: AttemptOutcome) -> Decision {
        if attempt >= self.max_attempts {
            return Decision::Stop;
        }
        let retryable = match outcome {
            AttemptOutcome::TransportError => true,
            AttemptOutcome::Status(code) => code == 429 || (500..=599).contains(&code) && code != 501,
        };
        if !retryable {
            return Decision::Stop;
        }
        Decision::Retry(self.backoff(attempt))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

/// Gzip payloads above [`COMPRESSION_THRESHOLD`]. A short write into the
/// encoder is treated as a hard local error.
pub fn prepare_payload(metrics: &[u8]) -> TrapResult<(Vec<u8>, bool)> {
    if metrics.len() <= COMPRESSION_THRESHOLD {
        return Ok((metrics.to_vec(), false));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let written = encoder
        .write(metrics)
        .map_err(|e| TrapError::Io(std::io::Error::other(format!("compressing metrics: {}", e))))?;
    if written != metrics.len() {
        return Err(TrapError::InvalidState(format!(
            "write length mismatch data length {} != written length {}",
            metrics.len(),
            written
        )));
    }
    let compressed = encoder
        .finish()
        .map_err(|e| TrapError::Io(std::io::Error::other(format!("closing gzip writer: {}", e))))?;
    Ok((compressed, true))
}

impl TrapSession {
    /// Deliver one payload to the submission URL. Returns the delivery
    /// outcome, a stale-endpoint classification, or a terminal error.
    pub(crate) async fn submit(&mut self, metrics: &[u8]) -> TrapResult<SubmitStatus> {
        if metrics.is_empty() {
            return Err(TrapError::InvalidState(
                "zero length data, no metrics to submit".to_string(),
            ));
        }

        let start = Instant::now();

        self.ensure_tls().await?;

        let (body, compressed) = prepare_payload(metrics)?;
        let submit_uuid = self.trace_payload(metrics, &body, compressed);
        let data_len = body.len();

        let client = self.build_submit_client()?;
        let policy = RetryPolicy::default();
        let mut attempt: u32 = 0;

        let (last, req_start) = loop {
            attempt += 1;
            let req_start = Instant::now();

            let mut request = client
                .put(&self.submission_url)
                .header(USER_AGENT, USER_AGENT_STRING)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json")
                .header(CONNECTION, "close")
                .header(CONTENT_LENGTH, data_len);
            if compressed {
                request = request.header(CONTENT_ENCODING, "gzip");
            }

            match request.body(body.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::OK {
                        break (Ok(response), req_start);
                    }
                    warn!(url = %self.submission_url, status = %status, "non-200 response");
                    if status == StatusCode::NOT_ACCEPTABLE {
                        warn!(
                            payload = %String::from_utf8_lossy(metrics),
                            "broker couldn't parse payload"
                        );
                    }
                    match policy.decide(attempt, AttemptOutcome::Status(status.as_u16())) {
                        Decision::Retry(wait) => {
                            info!(url = %self.submission_url, attempt, "retrying submission");
                            tokio::time::sleep(wait).await;
                        }
                        Decision::Stop => break (Ok(response), req_start),
                    }
                }
                Err(e) => {
                    if self.tls_name_mismatch() {
                        // common cause: new broker added to the cluster, or
                        // the check moved to a different broker
                        warn!(error = %e, "certificate name mismatch, refreshing TLS config");
                        self.clear_tls();
                        return Err(TrapError::CertNameMismatch(e.to_string()));
                    }
                    warn!(url = %self.submission_url, error = %e, "request error");
                    match policy.decide(attempt, AttemptOutcome::TransportError) {
                        Decision::Retry(wait) => {
                            info!(url = %self.submission_url, attempt, "retrying submission");
                            tokio::time::sleep(wait).await;
                        }
                        Decision::Stop => break (Err(e), req_start),
                    }
                }
            }
        };

        let response = match last {
            Ok(response) => response,
            Err(e) => return Err(TrapError::Transport(format!("making request: {}", e))),
        };

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TrapError::Transport(format!("reading response body: {}", e)))?;

        if status == StatusCode::NOT_FOUND && self.custom_submission_url.is_none() {
            return Ok(SubmitStatus::StaleEndpoint(TrapError::SubmitFailed {
                url: self.submission_url.clone(),
                status: status.as_u16(),
            }));
        }
        if status != StatusCode::OK {
            return Err(TrapError::SubmitFailed {
                url: self.submission_url.clone(),
                status: status.as_u16(),
            });
        }

        let mut result: SubmissionResult = serde_json::from_slice(&body).map_err(|e| {
            TrapError::Serialization(format!(
                "parsing response ({}): {}",
                String::from_utf8_lossy(&body),
                e
            ))
        })?;

        result.check_uuid = self
            .check_bundle
            .as_ref()
            .and_then(|b| b.check_uuids.first().cloned())
            .unwrap_or_default();
        result.submit_uuid = submit_uuid;
        result.submit_duration = start.elapsed();
        result.last_req_duration = req_start.elapsed();
        result.bytes_sent = data_len;
        result.compressed = compressed;
        if result.error.is_empty() {
            result.error = "none".to_string();
        }

        Ok(SubmitStatus::Delivered(result))
    }

    /// Single-use HTTP client: proxy from environment honored, short fixed
    /// dial timeout, keep-alive off, closed when the call's client drops
    fn build_submit_client(&self) -> TrapResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.submission_timeout)
            .tcp_keepalive(Duration::from_secs(3))
            .pool_max_idle_per_host(0);

        if let Some(tls) = self.tls_client_config() {
            builder = builder.use_preconfigured_tls((*tls).clone());
        }

        builder
            .build()
            .map_err(|e| TrapError::Transport(format!("building http client: {}", e)))
    }

    /// Trace the payload if tracing is configured. IO failures are logged
    /// but never abort the submission. Returns the correlation id used.
    fn trace_payload(&self, raw: &[u8], wire: &[u8], compressed: bool) -> String {
        match &self.trace {
            TraceTarget::Off => "n/a".to_string(),
            TraceTarget::Log => {
                info!(payload = %String::from_utf8_lossy(raw), "metric payload");
                "n/a".to_string()
            }
            TraceTarget::Dir(dir) => {
                let submit_uuid = Uuid::new_v4().to_string();
                let ts = chrono::Utc::now().format(TRACE_TS_FORMAT);
                let mut name = format!("{}_{}.json", ts, submit_uuid);
                if compressed {
                    name.push_str(".gz");
                }
                let path = dir.join(name);
                if let Err(e) = std::fs::write(&path, wire) {
                    error!(path = %path.display(), error = %e, "writing metric trace, skipping");
                } else {
                    debug!(path = %path.display(), "wrote metric trace");
                }
                submit_uuid
            }
        }
    }
}
