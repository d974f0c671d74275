//! trapflow: a client-side pipeline for delivering metric batches to a
//! monitoring service's ingestion brokers.
//!
//! Three concerns make up the core: discovering and caching the set of
//! available brokers and picking a healthy, capability-matching one
//! ([`broker`]), establishing pinned TLS trust to that broker without public
//! PKI ([`trust`]), and reliably transmitting a payload with compression,
//! tracing, and retry/backoff ([`submit`]). A [`TrapSession`] ties the three
//! together for one check.

pub mod api;
pub mod broker;
mod check;
pub mod config;
pub mod error;
pub mod session;
pub mod submit;
pub mod trust;

pub use api::{ApiClient, Broker, BrokerInstance, BrokerKind, CheckBundle, RestClient};
pub use broker::{BrokerCache, BrokerSelector};
pub use config::Config;
pub use error::{TrapError, TrapResult};
pub use session::{TraceSetting, TrapSession};
pub use submit::{RetryPolicy, SubmissionResult};
