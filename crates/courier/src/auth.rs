//! Credentials and authentication challenges.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;

use crate::trust::ServerTrust;

/// A user name and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    user: String,
    password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Create a credential.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// The user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// The `Authorization` header value for HTTP Basic authentication.
    pub fn basic_authorization(&self) -> String {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.user, self.password));
        format!("Basic {token}")
    }
}

/// Session-wide credentials, keyed by host.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    credentials: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `credential` for `host`, replacing any previous one.
    pub fn set(&mut self, host: impl Into<String>, credential: Credential) {
        self.credentials.insert(host.into(), credential);
    }

    /// The credential for `host`.
    pub fn credential_for(&self, host: &str) -> Option<&Credential> {
        self.credentials.get(host)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// HTTP authentication schemes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    /// HTTP Basic.
    Basic,
    /// HTTP Digest.
    Digest,
    /// Anything else, e.g. `Bearer` or `Negotiate`.
    Other(String),
}

/// An authentication challenge raised by a transport.
#[derive(Clone, Debug)]
pub enum AuthChallenge {
    /// The server presented a certificate chain to evaluate.
    ServerTrust {
        /// Host being connected to.
        host: String,
        /// The presented chain.
        trust: ServerTrust,
    },
    /// The server asked for HTTP credentials.
    Http {
        /// Host that issued the challenge.
        host: String,
        /// Challenge scheme.
        scheme: AuthScheme,
        /// Protection space realm, if given.
        realm: Option<String>,
        /// How many times this challenge already failed for the task.
        previous_failure_count: u32,
    },
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Only the first challenge in the header is considered.
    pub fn from_www_authenticate(value: &str, host: &str, previous_failure_count: u32) -> Self {
        let value = value.trim();
        let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));
        let scheme = if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else if scheme.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else {
            AuthScheme::Other(scheme.to_string())
        };

        let realm = params.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_string())
        });

        Self::Http {
            host: host.to_string(),
            scheme,
            realm,
            previous_failure_count,
        }
    }

    /// The challenged host.
    pub fn host(&self) -> &str {
        match self {
            Self::ServerTrust { host, .. } | Self::Http { host, .. } => host,
        }
    }
}

/// How a challenge should be answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Answer with this credential.
    UseCredential(Credential),
    /// Accept the presented server trust.
    TrustServer,
    /// Let the transport handle the challenge as it normally would.
    PerformDefaultHandling,
    /// Abort the request.
    CancelAuthenticationChallenge,
    /// Decline this protection space; the response is delivered as is.
    RejectProtectionSpace,
}
