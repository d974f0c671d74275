//! Broker TLS trust establishment
//!
//! Brokers are not fronted by public PKI: trust is pinned to a CA certificate
//! fetched from the monitoring API, and peers are accepted by certificate
//! common name against an allow-list derived from the broker's own instance
//! metadata. A single submission host may front multiple broker instances
//! with different per-instance certificates, so standard hostname
//! verification is replaced by the CN allow-list check.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::api::{ApiClient, Broker};
use crate::error::{TrapError, TrapResult};
use crate::session::TrapSession;

/// Submission hosts of the monitoring vendor that carry publicly trusted
/// certificates; no pinning needed
const PUBLIC_CA_HOST: &str = "api.circonus.com";

/// TLS state for one session's submission endpoint
#[derive(Debug, Clone)]
pub(crate) enum TlsState {
    /// Plain http, or a public-CA endpoint: system trust, no custom config
    Plain,
    /// Caller-supplied configuration, used verbatim
    Custom(Arc<rustls::ClientConfig>),
    /// CN-pinned configuration built from broker metadata
    Pinned(PinnedTls),
}

impl TlsState {
    pub(crate) fn client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        match self {
            TlsState::Plain => None,
            TlsState::Custom(cfg) => Some(cfg.clone()),
            TlsState::Pinned(pinned) => Some(pinned.config.clone()),
        }
    }

    /// Did the pinned verifier record a CN mismatch on the last handshake?
    pub(crate) fn name_mismatch(&self) -> bool {
        match self {
            TlsState::Pinned(pinned) => pinned.mismatch.load(Ordering::SeqCst),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PinnedTls {
    pub(crate) config: Arc<rustls::ClientConfig>,
    mismatch: Arc<AtomicBool>,
    /// Primary CN expected for the submission host
    pub(crate) cn: String,
}

/// Verification strategy holding the pinned root pool and CN allow-list as
/// immutable fields, invoked through rustls' standard verification hook.
/// Rejects any peer whose leaf CN is absent from the allow-list, then
/// verifies the chain against the pinned pool using presented intermediates.
/// No hostname verification step.
pub struct PinnedVerifier {
    anchors: Vec<TrustAnchor<'static>>,
    allowed_cns: Vec<String>,
    mismatch: Arc<AtomicBool>,
    algs: WebPkiSupportedAlgorithms,
}

impl std::fmt::Debug for PinnedVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedVerifier")
            .field("anchors", &self.anchors.len())
            .field("allowed_cns", &self.allowed_cns)
            .finish_non_exhaustive()
    }
}

impl PinnedVerifier {
    fn new(
        anchors: Vec<TrustAnchor<'static>>,
        allowed_cns: Vec<String>,
        mismatch: Arc<AtomicBool>,
    ) -> Self {
        Self {
            anchors,
            allowed_cns,
            mismatch,
            algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

/// Extract the subject common name from a DER-encoded certificate
fn leaf_common_name(der: &CertificateDer<'_>) -> Result<String, rustls::Error> {
    use x509_parser::prelude::FromDer;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der.as_ref())
        .map_err(|e| rustls::Error::General(format!("parse peer certificate: {}", e)))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| rustls::Error::General("peer certificate has no common name".to_string()))
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let common_name = leaf_common_name(end_entity)?;
        if !self.allowed_cns.iter().any(|cn| *cn == common_name) {
            warn!(
                cn = %common_name,
                acceptable = %self.allowed_cns.join(","),
                "peer certificate CN not in allow-list"
            );
            self.mismatch.store(true, Ordering::SeqCst);
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }

        let leaf = webpki::EndEntityCert::try_from(end_entity)
            .map_err(|e| rustls::Error::General(format!("parse peer certificate: {}", e)))?;
        leaf.verify_for_usage(
            self.algs.all,
            &self.anchors,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| rustls::Error::General(format!("peer cert verify: {}", e)))?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Build a CN-pinned rustls client config from PEM CA text and the CN
/// allow-list. Minimum TLS 1.2.
pub(crate) fn build_pinned_config(
    ca_pem: &[u8],
    cn: String,
    allowed_cns: Vec<String>,
) -> TrapResult<PinnedTls> {
    let mut reader = std::io::BufReader::new(ca_pem);
    let mut anchors: Vec<TrustAnchor<'static>> = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        let der = cert.map_err(|e| TrapError::Trust(format!("reading CA PEM: {}", e)))?;
        let anchor = webpki::anchor_from_trusted_cert(&der)
            .map_err(|e| TrapError::Trust(format!("unable to append cert to pool: {}", e)))?
            .to_owned();
        anchors.push(anchor);
    }
    if anchors.is_empty() {
        return Err(TrapError::Trust(
            "unable to append cert to pool (no certificates in PEM)".to_string(),
        ));
    }

    let mismatch = Arc::new(AtomicBool::new(false));
    let verifier = PinnedVerifier::new(anchors, allowed_cns, mismatch.clone());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TrapError::Trust(format!("tls protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(PinnedTls {
        config: Arc::new(config),
        mismatch,
        cn,
    })
}

/// Derive from the broker's active instances the primary CN expected for the
/// submission host and the full list of CNs acceptable for that host.
/// For a non-IP host, trust defers to ordinary hostname verification against
/// that single name.
pub(crate) fn broker_cn_list(
    broker: &Broker,
    submission_url: &str,
) -> TrapResult<(String, Vec<String>)> {
    let url = Url::parse(submission_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| TrapError::Config(format!("no host in submission URL ({})", submission_url)))?
        .to_string();

    if host.parse::<IpAddr>().is_err() {
        // FQDN: the hostname itself is the single expected CN
        return Ok((host.clone(), vec![host]));
    }

    let mut cn = String::new();
    let mut cn_list = Vec::with_capacity(broker.details.len());
    for instance in &broker.details {
        if !instance.is_active() {
            continue;
        }
        let matches = instance.ip.as_deref() == Some(host.as_str())
            || instance.external_host.as_deref() == Some(host.as_str());
        if matches {
            if cn.is_empty() {
                cn = instance.cn.clone();
            }
            cn_list.push(instance.cn.clone());
        }
    }

    if cn_list.is_empty() {
        return Err(TrapError::Trust(format!(
            "unable to match URL host ({}) to broker instance",
            host
        )));
    }

    Ok((cn, cn_list))
}

/// CA certificate envelope returned from the monitoring API
#[derive(Debug, Deserialize)]
struct CaCert {
    #[serde(default)]
    contents: String,
}

/// Fetch the broker CA certificate (PEM) through the API
pub(crate) async fn fetch_ca_cert(client: &Arc<dyn ApiClient>) -> TrapResult<Vec<u8>> {
    debug!("fetching broker cert from api");
    let response = client
        .get("/pki/ca.crt")
        .await
        .map_err(|e| TrapError::Trust(format!("fetch broker CA cert from API: {}", e)))?;

    let cadata: CaCert = serde_json::from_slice(&response)
        .map_err(|e| TrapError::Trust(format!("json unmarshal cert: {}", e)))?;

    if cadata.contents.is_empty() {
        return Err(TrapError::Trust(
            "unable to find ca cert contents".to_string(),
        ));
    }

    Ok(cadata.contents.into_bytes())
}

impl TrapSession {
    /// Establish the TLS state for the submission endpoint, unless one is
    /// already cached for this session. Short-circuits, in order: cached
    /// config, plain http, caller-supplied config, public-CA endpoint;
    /// otherwise builds the pinned configuration.
    pub(crate) async fn ensure_tls(&mut self) -> TrapResult<()> {
        if self.tls.is_some() {
            return Ok(());
        }

        let url = Url::parse(&self.submission_url)?;
        if url.scheme() == "http" {
            self.tls = Some(TlsState::Plain);
            return Ok(());
        }

        if let Some(custom) = &self.custom_tls {
            self.tls = Some(TlsState::Custom(custom.clone()));
            return Ok(());
        }

        if self.is_public_broker()? {
            self.tls = Some(TlsState::Plain);
            return Ok(());
        }

        if self.broker.is_none() {
            let bundle = self
                .check_bundle
                .as_ref()
                .ok_or_else(|| TrapError::InvalidState("check bundle not initialized".to_string()))?;
            let cid = bundle
                .brokers
                .first()
                .ok_or_else(|| TrapError::InvalidState("invalid check bundle, 0 brokers".to_string()))?
                .clone();
            let check_type = bundle.check_type.clone();
            let broker = self.selector.fetch(&cid, &check_type).await?;
            self.broker = Some(broker);
        }

        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| TrapError::InvalidState("broker not resolved".to_string()))?;
        let (cn, cn_list) =
            broker_cn_list(broker, &self.submission_url).map_err(|e| match e {
                TrapError::Trust(msg) => TrapError::Trust(format!("broker cn list: {}", msg)),
                other => other,
            })?;

        let ca_pem = fetch_ca_cert(&self.client).await?;
        let pinned = build_pinned_config(&ca_pem, cn, cn_list)?;
        debug!(cn = %pinned.cn, "built pinned TLS config");
        self.tls = Some(TlsState::Pinned(pinned));
        Ok(())
    }

    /// Drop the cached broker reference and TLS state so the next submission
    /// re-resolves both from scratch
    pub(crate) fn clear_tls(&mut self) {
        self.broker = None;
        self.tls = None;
    }

    fn is_public_broker(&self) -> TrapResult<bool> {
        if self.submission_url.is_empty() {
            return Err(TrapError::InvalidState("no submission url".to_string()));
        }
        if self.public_ca {
            return Ok(true);
        }
        Ok(self.submission_url.contains(PUBLIC_CA_HOST))
    }
}
