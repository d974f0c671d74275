//! Error types for the submission pipeline

use std::fmt;

/// Result type alias for trapflow operations
pub type TrapResult<T> = Result<T, TrapError>;

/// Errors that can occur while selecting brokers, establishing trust,
/// or submitting metrics
#[derive(Debug)]
pub enum TrapError {
    /// Invalid or missing configuration (malformed duration, bad check type, ...)
    Config(String),

    /// The backing monitoring API returned an error
    Api(String),

    /// Shared state used before it was populated (broker cache, check bundle, ...)
    InvalidState(String),

    /// No broker with the requested identifier exists
    BrokerNotFound(String),

    /// A specific broker failed validation, or no candidate survived it
    NoValidBroker(String),

    /// CA fetch, certificate pool construction, or TLS config assembly failed
    Trust(String),

    /// The peer presented a certificate whose CN is not in the allow-list
    CertNameMismatch(String),

    /// Dial/handshake/IO failure talking to the broker, after retries
    Transport(String),

    /// The broker answered with a terminal non-200 status
    SubmitFailed { url: String, status: u16 },

    /// I/O error (trace files, etc.)
    Io(std::io::Error),

    /// Payload or response (de)serialization error
    Serialization(String),
}

impl fmt::Display for TrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            TrapError::Api(msg) => write!(f, "api error: {}", msg),
            TrapError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            TrapError::BrokerNotFound(cid) => write!(f, "no broker with CID ({}) found", cid),
            TrapError::NoValidBroker(msg) => write!(f, "no valid broker: {}", msg),
            TrapError::Trust(msg) => write!(f, "establishing broker trust: {}", msg),
            TrapError::CertNameMismatch(msg) => {
                write!(f, "certificate name mismatch: {}", msg)
            }
            TrapError::Transport(msg) => write!(f, "transport error: {}", msg),
            TrapError::SubmitFailed { url, status } => {
                write!(f, "submitting metrics ({} {})", url, status)
            }
            TrapError::Io(err) => write!(f, "I/O error: {}", err),
            TrapError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for TrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrapError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrapError {
    fn from(err: std::io::Error) -> Self {
        TrapError::Io(err)
    }
}

impl From<serde_json::Error> for TrapError {
    fn from(err: serde_json::Error) -> Self {
        TrapError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for TrapError {
    fn from(err: url::ParseError) -> Self {
        TrapError::Config(format!("parse submission URL: {}", err))
    }
}
