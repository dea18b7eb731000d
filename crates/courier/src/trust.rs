//! Server trust evaluation and pinning.
//!
//! A [`ServerTrustManager`] maps host names to [`ServerTrustPolicy`] values.
//! It is built once, handed to the [`SessionBuilder`](crate::SessionBuilder),
//! and consulted for every server trust challenge.
//!
//! ```ignore
//! use courier::trust::{ServerTrustManager, ServerTrustPolicy};
//! use courier::tls::Certificate;
//!
//! let pinned = Certificate::from_pem_file("api.example.com.pem")?;
//! let manager = ServerTrustManager::new([
//!     ("api.example.com", ServerTrustPolicy::pin_certificates([pinned])),
//!     ("localhost", ServerTrustPolicy::DisableEvaluation),
//! ]);
//!
//! let session = Session::builder().server_trust_manager(manager).build()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::client::{verify_server_cert_signed_by_trust_anchor, verify_server_name};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;

use crate::error::ServerTrustFailure;
use crate::logging::targets;
use crate::tls::{Certificate, PublicKey};

/// The certificate chain a server presented, leaf first.
#[derive(Clone, Debug)]
pub struct ServerTrust {
    chain: Vec<CertificateDer<'static>>,
    now: UnixTime,
    roots: Option<Arc<RootCertStore>>,
}

impl ServerTrust {
    /// Wrap a presented chain, evaluated at the current time.
    pub fn new(chain: impl IntoIterator<Item = Certificate>) -> Self {
        Self::from_der_chain(chain.into_iter().map(|c| c.der().clone()).collect())
    }

    pub(crate) fn from_der_chain(chain: Vec<CertificateDer<'static>>) -> Self {
        Self {
            chain,
            now: UnixTime::now(),
            roots: None,
        }
    }

    /// Evaluate validity dates at `now` instead of the current time.
    pub fn at(mut self, now: UnixTime) -> Self {
        self.now = now;
        self
    }

    /// Run standard validation against `roots` instead of the bundled
    /// WebPKI roots.
    pub fn with_roots(mut self, roots: Arc<RootCertStore>) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Use `roots` unless roots were already chosen.
    pub(crate) fn or_roots(self, roots: &Arc<RootCertStore>) -> Self {
        match self.roots {
            Some(_) => self,
            None => self.with_roots(roots.clone()),
        }
    }

    /// The presented certificates, leaf first.
    pub fn certificates(&self) -> Vec<Certificate> {
        self.chain.iter().cloned().map(Certificate::from).collect()
    }

    /// Public keys of the presented certificates. Unparsable certificates are skipped.
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.chain
            .iter()
            .filter_map(|der| PublicKey::from_certificate_der(der.as_ref()).ok())
            .collect()
    }

    /// Validate the chain against `roots`, optionally binding `host`.
    fn validate(&self, roots: &RootCertStore, host: Option<&str>) -> Result<(), String> {
        let (leaf, intermediates) = self
            .chain
            .split_first()
            .ok_or_else(|| "no certificates presented".to_string())?;
        let parsed = ParsedCertificate::try_from(leaf).map_err(|e| e.to_string())?;
        let algorithms = rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .all;

        verify_server_cert_signed_by_trust_anchor(&parsed, roots, intermediates, self.now, algorithms)
            .map_err(|e| e.to_string())?;

        if let Some(host) = host {
            let name = ServerName::try_from(host).map_err(|e| e.to_string())?;
            verify_server_name(&parsed, &name).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Caller-supplied trust predicate.
pub type TrustPredicate = Arc<dyn Fn(&ServerTrust, &str) -> bool + Send + Sync>;

/// How a host's certificate chain is evaluated.
#[derive(Clone)]
pub enum ServerTrustPolicy {
    /// Standard chain validation against the session's root store: the
    /// bundled WebPKI roots plus any roots added through
    /// [`TlsConfig`](crate::tls::TlsConfig).
    DefaultEvaluation {
        /// Also require the certificate to match the host name.
        validate_host: bool,
    },
    /// Accept the host only when the chain matches a pinned certificate.
    PinCertificates {
        /// Pinned certificates.
        certificates: Vec<Certificate>,
        /// Use the pinned certificates as the only trust anchors and run
        /// chain validation. When off, any byte-identical certificate in the
        /// presented chain passes, without date or signature checks.
        validate_chain: bool,
        /// Also require the leaf to match the host name. Only applies when
        /// the chain is validated.
        validate_host: bool,
    },
    /// Accept the host when any presented certificate carries a pinned key.
    ///
    /// Host names are not checked unless `validate_host` is set.
    PinPublicKeys {
        /// Pinned keys.
        keys: Vec<PublicKey>,
        /// Run standard chain validation first, failing closed.
        validate_chain: bool,
        /// Also require the leaf to match the host name.
        validate_host: bool,
    },
    /// Trust any certificate.
    ///
    /// This disables certificate checks entirely and makes the connection
    /// vulnerable to man-in-the-middle attacks. Never use it in production.
    DisableEvaluation,
    /// Decide with a caller-supplied predicate.
    Custom(TrustPredicate),
}

impl fmt::Debug for ServerTrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultEvaluation { validate_host } => f
                .debug_struct("DefaultEvaluation")
                .field("validate_host", validate_host)
                .finish(),
            Self::PinCertificates {
                certificates,
                validate_chain,
                validate_host,
            } => f
                .debug_struct("PinCertificates")
                .field("certificates", &certificates.len())
                .field("validate_chain", validate_chain)
                .field("validate_host", validate_host)
                .finish(),
            Self::PinPublicKeys {
                keys,
                validate_chain,
                validate_host,
            } => f
                .debug_struct("PinPublicKeys")
                .field("keys", &keys.len())
                .field("validate_chain", validate_chain)
                .field("validate_host", validate_host)
                .finish(),
            Self::DisableEvaluation => f.write_str("DisableEvaluation"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl ServerTrustPolicy {
    /// Default evaluation with host validation.
    pub fn default_evaluation() -> Self {
        Self::DefaultEvaluation {
            validate_host: true,
        }
    }

    /// Pin certificates, validating the chain and host.
    pub fn pin_certificates(certificates: impl IntoIterator<Item = Certificate>) -> Self {
        Self::PinCertificates {
            certificates: certificates.into_iter().collect(),
            validate_chain: true,
            validate_host: true,
        }
    }

    /// Pin public keys, validating the chain but not the host.
    pub fn pin_public_keys(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        Self::PinPublicKeys {
            keys: keys.into_iter().collect(),
            validate_chain: true,
            validate_host: false,
        }
    }

    /// Pin the public keys of `certificates`. Unparsable certificates are skipped.
    pub fn pin_public_keys_of(certificates: &[Certificate]) -> Self {
        Self::pin_public_keys(certificates.iter().filter_map(|c| c.public_key().ok()))
    }

    /// Decide with a predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&ServerTrust, &str) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Set whether the chain is validated (pinning policies only).
    pub fn validate_chain(mut self, validate: bool) -> Self {
        match &mut self {
            Self::PinCertificates { validate_chain, .. }
            | Self::PinPublicKeys { validate_chain, .. } => *validate_chain = validate,
            _ => {}
        }
        self
    }

    /// Set whether the host name is validated.
    pub fn validate_host(mut self, validate: bool) -> Self {
        match &mut self {
            Self::DefaultEvaluation { validate_host }
            | Self::PinCertificates { validate_host, .. }
            | Self::PinPublicKeys { validate_host, .. } => *validate_host = validate,
            _ => {}
        }
        self
    }

    /// Whether `trust` is acceptable for `host`.
    pub fn evaluate(&self, trust: &ServerTrust, host: &str) -> bool {
        self.check(trust, host).is_ok()
    }

    /// Evaluate `trust` for `host`, naming the reason on failure.
    pub fn check(&self, trust: &ServerTrust, host: &str) -> Result<(), ServerTrustFailure> {
        match self {
            Self::DefaultEvaluation { validate_host } => {
                default_validation(trust, host, *validate_host)
            }
            Self::PinCertificates {
                certificates,
                validate_chain,
                validate_host,
            } => {
                let pinning_failed = || ServerTrustFailure::CertificatePinningFailed {
                    host: host.to_string(),
                };
                if certificates.is_empty() {
                    return Err(pinning_failed());
                }

                if *validate_chain {
                    let mut anchors = RootCertStore::empty();
                    for cert in certificates {
                        // Certificates that cannot act as anchors simply never match.
                        let _ = anchors.add(cert.der().clone());
                    }
                    let bound_host = validate_host.then_some(host);
                    trust.validate(&anchors, bound_host).map_err(|reason| {
                        tracing::debug!(target: targets::TRUST, host, reason = %reason, "pinned chain validation failed");
                        pinning_failed()
                    })
                } else {
                    let matched = trust
                        .chain
                        .iter()
                        .any(|presented| certificates.iter().any(|pinned| pinned.as_der() == presented.as_ref()));
                    if matched { Ok(()) } else { Err(pinning_failed()) }
                }
            }
            Self::PinPublicKeys {
                keys,
                validate_chain,
                validate_host,
            } => {
                if *validate_chain {
                    default_validation(trust, host, *validate_host)?;
                } else if *validate_host {
                    host_validation(trust, host)?;
                }

                let presented = trust.public_keys();
                if presented.iter().any(|key| keys.contains(key)) {
                    Ok(())
                } else {
                    Err(ServerTrustFailure::PublicKeyPinningFailed {
                        host: host.to_string(),
                    })
                }
            }
            Self::DisableEvaluation => Ok(()),
            Self::Custom(predicate) => {
                if predicate(trust, host) {
                    Ok(())
                } else {
                    Err(ServerTrustFailure::CustomEvaluationFailed {
                        host: host.to_string(),
                    })
                }
            }
        }
    }
}

fn webpki_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn default_validation(
    trust: &ServerTrust,
    host: &str,
    validate_host: bool,
) -> Result<(), ServerTrustFailure> {
    if trust.chain.is_empty() {
        return Err(ServerTrustFailure::NoCertificatesFound {
            host: host.to_string(),
        });
    }
    let bundled;
    let roots = match &trust.roots {
        Some(roots) => roots.as_ref(),
        None => {
            bundled = webpki_roots();
            &bundled
        }
    };
    trust
        .validate(roots, validate_host.then_some(host))
        .map_err(|reason| ServerTrustFailure::DefaultEvaluationFailed {
            host: host.to_string(),
            reason,
        })
}

fn host_validation(trust: &ServerTrust, host: &str) -> Result<(), ServerTrustFailure> {
    let failed = |reason: String| ServerTrustFailure::DefaultEvaluationFailed {
        host: host.to_string(),
        reason,
    };
    let leaf = trust.chain.first().ok_or_else(|| ServerTrustFailure::NoCertificatesFound {
        host: host.to_string(),
    })?;
    let parsed = ParsedCertificate::try_from(leaf).map_err(|e| failed(e.to_string()))?;
    let name = ServerName::try_from(host).map_err(|e| failed(e.to_string()))?;
    verify_server_name(&parsed, &name).map_err(|e| failed(e.to_string()))
}

/// Outcome of a manager evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustDecision {
    /// The host's policy accepted the chain.
    Trusted,
    /// No policy applies; use standard handling.
    PerformDefaultHandling,
    /// The chain was rejected.
    Rejected(ServerTrustFailure),
}

/// Immutable host-to-policy table.
#[derive(Clone, Debug)]
pub struct ServerTrustManager {
    policies: HashMap<String, ServerTrustPolicy>,
    all_hosts_must_be_evaluated: bool,
}

impl ServerTrustManager {
    /// Create a manager that requires a policy for every host.
    pub fn new<H: Into<String>>(policies: impl IntoIterator<Item = (H, ServerTrustPolicy)>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|(host, policy)| (host.into(), policy))
                .collect(),
            all_hosts_must_be_evaluated: true,
        }
    }

    /// Allow hosts without a policy to use standard handling.
    pub fn allow_unlisted_hosts(mut self) -> Self {
        self.all_hosts_must_be_evaluated = false;
        self
    }

    /// Whether every host must have a policy.
    pub fn all_hosts_must_be_evaluated(&self) -> bool {
        self.all_hosts_must_be_evaluated
    }

    /// The policy for `host`, if any.
    pub fn policy_for(&self, host: &str) -> Option<&ServerTrustPolicy> {
        self.policies.get(host)
    }

    /// Evaluate `trust` for `host`.
    pub fn evaluate(&self, trust: &ServerTrust, host: &str) -> TrustDecision {
        let Some(policy) = self.policy_for(host) else {
            if self.all_hosts_must_be_evaluated {
                tracing::warn!(target: targets::TRUST, host, "no server trust policy for host");
                return TrustDecision::Rejected(ServerTrustFailure::NoPolicyForHost {
                    host: host.to_string(),
                });
            }
            return TrustDecision::PerformDefaultHandling;
        };

        match policy.check(trust, host) {
            Ok(()) => {
                tracing::debug!(target: targets::TRUST, host, "server trust evaluation passed");
                TrustDecision::Trusted
            }
            Err(failure) => {
                tracing::warn!(target: targets::TRUST, host, error = %failure, "server trust evaluation failed");
                TrustDecision::Rejected(failure)
            }
        }
    }
}
