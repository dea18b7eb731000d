//! TLS configuration and certificate types.
//!
//! # Custom CA Certificates
//!
//! ```ignore
//! use courier::tls::{Certificate, TlsConfig};
//!
//! let ca_cert = Certificate::from_pem_file("/path/to/ca.crt")?;
//!
//! let session = Session::builder()
//!     .tls_config(TlsConfig::new().add_root_certificate(ca_cert))
//!     .build()?;
//! ```
//!
//! # TLS Version Selection
//!
//! ```ignore
//! use courier::tls::TlsVersion;
//!
//! let session = Session::builder()
//!     .min_tls_version(TlsVersion::Tls1_3)
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{CourierError, Result, ServerTrustFailure};
use crate::logging::targets;
use crate::trust::{ServerTrust, ServerTrustManager, TrustDecision};

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 (default minimum).
    #[default]
    Tls1_2,
    /// TLS 1.3 (most secure).
    Tls1_3,
}

impl TlsVersion {
    /// Convert to rustls protocol versions.
    pub(crate) fn to_rustls_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls1_2 => vec![&rustls::version::TLS12, &rustls::version::TLS13],
            TlsVersion::Tls1_3 => vec![&rustls::version::TLS13],
        }
    }
}

/// A single DER-encoded X.509 certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl Certificate {
    /// Load the first certificate from PEM-encoded bytes.
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        Self::from_pem_bundle(pem_data)?
            .into_iter()
            .next()
            .ok_or_else(|| CourierError::InvalidCertificate("no certificates found in PEM data".into()))
    }

    /// Load a certificate from a PEM-encoded file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(read_file(path.as_ref())?)
    }

    /// Load a certificate from DER-encoded bytes.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der: CertificateDer::from(der_data.into()),
        }
    }

    /// Load a certificate from a DER-encoded file.
    pub fn from_der_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_der(read_file(path.as_ref())?))
    }

    /// Load every certificate from PEM-encoded bytes.
    pub fn from_pem_bundle(pem_data: impl AsRef<[u8]>) -> Result<Vec<Self>> {
        let mut reader = BufReader::new(Cursor::new(pem_data.as_ref()));
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CourierError::InvalidCertificate(format!("failed to parse PEM: {e}")))?;

        Ok(certs.into_iter().map(|der| Self { der }).collect())
    }

    /// Load every certificate from a PEM-encoded file.
    pub fn from_pem_bundle_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        Self::from_pem_bundle(read_file(path.as_ref())?)
    }

    /// The DER bytes.
    pub fn as_der(&self) -> &[u8] {
        self.der.as_ref()
    }

    /// Extract the certificate's public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_certificate_der(self.as_der())
    }

    pub(crate) fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }
}

impl From<CertificateDer<'static>> for Certificate {
    fn from(der: CertificateDer<'static>) -> Self {
        Self { der }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        CourierError::InvalidCertificate(format!(
            "failed to read certificate file '{}': {e}",
            path.display()
        ))
    })
}

/// A public key, compared by its DER `SubjectPublicKeyInfo`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    spki: Bytes,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("spki_len", &self.spki.len())
            .finish()
    }
}

impl PublicKey {
    /// Wrap DER `SubjectPublicKeyInfo` bytes.
    pub fn from_spki_der(spki: impl Into<Bytes>) -> Self {
        Self { spki: spki.into() }
    }

    /// Extract the public key of a DER certificate.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CourierError::InvalidCertificate(format!("failed to parse certificate: {e}")))?;
        Ok(Self::from_spki_der(Bytes::copy_from_slice(cert.public_key().raw)))
    }

    /// The DER `SubjectPublicKeyInfo` bytes.
    pub fn as_spki_der(&self) -> &[u8] {
        &self.spki
    }
}

/// TLS configuration for the default transport.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Whether to use only the provided root certificates (no bundled roots).
    pub use_only_custom_roots: bool,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
}

impl TlsConfig {
    /// Create a new TLS configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root certificate to trust.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Add multiple root certificates.
    pub fn add_root_certificates(mut self, certs: impl IntoIterator<Item = Certificate>) -> Self {
        self.root_certificates.extend(certs);
        self
    }

    /// Use only custom root certificates.
    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    /// Set the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Build the root certificate store.
    pub fn build_root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        if !self.use_only_custom_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for cert in &self.root_certificates {
            root_store.add(cert.der().clone()).map_err(|e| {
                CourierError::InvalidCertificate(format!("failed to add root certificate: {e}"))
            })?;
        }

        if root_store.is_empty() {
            return Err(CourierError::InvalidCertificate(
                "no root certificates available; add custom certificates or \
                 don't use use_only_custom_roots()"
                    .to_string(),
            ));
        }

        Ok(root_store)
    }

    /// Build a rustls client config whose certificate checks go through
    /// `verifier`.
    pub(crate) fn build_rustls_config(&self, verifier: Arc<TrustVerifier>) -> Result<ClientConfig> {
        let versions = self.min_version.to_rustls_versions();
        let mut config = ClientConfig::builder_with_provider(verifier.provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|e| CourierError::InvalidCertificate(format!("unsupported TLS versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Trust failures recorded by the verifier, keyed by host.
///
/// The TLS stack only surfaces a generic handshake error, so the transport
/// looks up the recorded failure afterwards to report the specific cause.
#[derive(Debug, Default)]
pub(crate) struct TrustFailureLog {
    failures: Mutex<HashMap<String, ServerTrustFailure>>,
}

impl TrustFailureLog {
    fn record(&self, failure: ServerTrustFailure) {
        self.failures
            .lock()
            .insert(failure.host().to_string(), failure);
    }

    fn clear(&self, host: &str) {
        self.failures.lock().remove(host);
    }

    pub(crate) fn failure_for(&self, host: &str) -> Option<ServerTrustFailure> {
        self.failures.lock().get(host).cloned()
    }
}

/// Certificate verifier that routes server trust through a [`ServerTrustManager`].
///
/// Hosts without a policy (when the manager allows that) and all hosts when
/// no manager is configured fall back to standard WebPKI validation.
#[derive(Debug)]
pub(crate) struct TrustVerifier {
    manager: Option<Arc<ServerTrustManager>>,
    roots: Arc<RootCertStore>,
    default: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    failures: Arc<TrustFailureLog>,
}

impl TrustVerifier {
    pub(crate) fn new(
        config: &TlsConfig,
        manager: Option<Arc<ServerTrustManager>>,
        failures: Arc<TrustFailureLog>,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(config.build_root_store()?);
        let default = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| CourierError::InvalidCertificate(format!("failed to build verifier: {e}")))?;

        Ok(Self {
            manager,
            roots,
            default,
            provider,
            failures,
        })
    }
}

fn host_of(server_name: &ServerName<'_>) -> String {
    match server_name {
        ServerName::DnsName(name) => name.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        other => format!("{other:?}"),
    }
}

impl ServerCertVerifier for TrustVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let Some(manager) = &self.manager else {
            return self
                .default
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        };

        let host = host_of(server_name);
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        let trust = ServerTrust::from_der_chain(chain)
            .at(now)
            .with_roots(self.roots.clone());

        match manager.evaluate(&trust, &host) {
            TrustDecision::Trusted => {
                self.failures.clear(&host);
                Ok(ServerCertVerified::assertion())
            }
            TrustDecision::PerformDefaultHandling => self
                .default
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now),
            TrustDecision::Rejected(failure) => {
                tracing::warn!(target: targets::TRUST, host = %host, error = %failure, "rejecting server certificate");
                let message = failure.to_string();
                self.failures.record(failure);
                Err(rustls::Error::General(message))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::ServerTrustPolicy;

    fn self_signed(host: &str) -> Certificate {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![host.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        Certificate::from_der(cert.der().to_vec())
    }

    #[test]
    fn test_tls_version_to_rustls_versions() {
        assert_eq!(TlsVersion::default(), TlsVersion::Tls1_2);
        assert_eq!(TlsVersion::Tls1_2.to_rustls_versions().len(), 2);
        assert_eq!(TlsVersion::Tls1_3.to_rustls_versions().len(), 1);
    }

    #[test]
    fn test_certificate_pem_round_trip() {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["a.test".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        let pem = format!("{}{}", cert.pem(), cert.pem());

        let bundle = Certificate::from_pem_bundle(&pem).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(Certificate::from_pem(&pem).unwrap().as_der(), cert.der().as_ref());
        assert!(Certificate::from_pem("no certificates here").is_err());
    }

    #[test]
    fn test_public_key_extraction() {
        let cert = self_signed("a.test");
        let key = cert.public_key().unwrap();
        assert!(!key.as_spki_der().is_empty());
        assert_eq!(key, cert.public_key().unwrap());
        assert_ne!(key, self_signed("a.test").public_key().unwrap());

        assert!(Certificate::from_der(vec![0x30, 0x03, 0x02, 0x01, 0x00]).public_key().is_err());
    }

    #[test]
    fn test_root_store() {
        assert!(TlsConfig::new().build_root_store().is_ok());
        assert!(TlsConfig::new().use_only_custom_roots().build_root_store().is_err());

        let custom = TlsConfig::new()
            .use_only_custom_roots()
            .add_root_certificate(self_signed("a.test"))
            .build_root_store()
            .unwrap();
        assert_eq!(custom.len(), 1);
    }

    #[test]
    fn test_verifier_default_evaluation_honours_custom_roots() {
        let cert = self_signed("internal.test");
        let manager = ServerTrustManager::new([(
            "internal.test",
            ServerTrustPolicy::default_evaluation(),
        )]);
        let config = TlsConfig::new().add_root_certificate(cert.clone());

        let verifier = TrustVerifier::new(
            &config,
            Some(Arc::new(manager)),
            Arc::new(TrustFailureLog::default()),
        )
        .unwrap();
        let name = ServerName::try_from("internal.test").unwrap();
        assert!(verifier
            .verify_server_cert(cert.der(), &[], &name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn test_verifier_records_rejections() {
        let pinned = self_signed("pinned.test");
        let presented = self_signed("pinned.test");
        let manager = ServerTrustManager::new([(
            "pinned.test",
            ServerTrustPolicy::pin_certificates([pinned]).validate_chain(false),
        )]);

        let failures = Arc::new(TrustFailureLog::default());
        let verifier =
            TrustVerifier::new(&TlsConfig::new(), Some(Arc::new(manager)), failures.clone()).unwrap();

        let name = ServerName::try_from("pinned.test").unwrap();
        let result = verifier.verify_server_cert(presented.der(), &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
        assert!(matches!(
            failures.failure_for("pinned.test"),
            Some(ServerTrustFailure::CertificatePinningFailed { .. })
        ));

        let config = TlsConfig::new().build_rustls_config(Arc::new(verifier));
        assert!(config.is_ok());
    }
}
