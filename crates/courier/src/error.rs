//! Error types for courier.
//!
//! Every failure a request can end with is a [`CourierError`]. Errors are
//! cheap to clone because the same value is handed to the retrier, recorded
//! on the request, broadcast in [`RequestEvent::Finished`](crate::RequestEvent),
//! and returned from every response handler.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Categories of low-level transport failures.
///
/// Retry policies decide on these kinds rather than on error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The request timed out.
    TimedOut,
    /// The host name could not be resolved to a server.
    CannotFindHost,
    /// The server refused or failed the connection.
    CannotConnectToHost,
    /// DNS resolution failed.
    DnsLookupFailed,
    /// The connection dropped while the request was in flight.
    NetworkConnectionLost,
    /// No network is available.
    NotConnectedToInternet,
    /// The TLS handshake failed.
    SecureConnectionFailed,
    /// The server sent a malformed response.
    BadServerResponse,
    /// The redirect limit was exceeded.
    TooManyRedirects,
    /// The task was cancelled.
    Cancelled,
    /// A local file operation failed.
    FileSystem,
    /// Any other failure.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TimedOut => "timed out",
            Self::CannotFindHost => "cannot find host",
            Self::CannotConnectToHost => "cannot connect to host",
            Self::DnsLookupFailed => "DNS lookup failed",
            Self::NetworkConnectionLost => "network connection lost",
            Self::NotConnectedToInternet => "not connected to internet",
            Self::SecureConnectionFailed => "secure connection failed",
            Self::BadServerResponse => "bad server response",
            Self::TooManyRedirects => "too many redirects",
            Self::Cancelled => "cancelled",
            Self::FileSystem => "file system error",
            Self::Other => "transport error",
        };
        f.write_str(name)
    }
}

/// A failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Failure category.
    pub kind: TransportErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl TransportError {
    /// Create a transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error a transport reports for a cancelled task.
    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "task was cancelled")
    }

    /// Whether this error reports a cancelled task.
    pub fn is_cancelled(&self) -> bool {
        self.kind == TransportErrorKind::Cancelled
    }
}

impl From<&reqwest::Error> for TransportError {
    fn from(err: &reqwest::Error) -> Self {
        let message = error_chain_message(err);
        let kind = if err.is_timeout() {
            TransportErrorKind::TimedOut
        } else if chain_contains_tls_error(err) {
            TransportErrorKind::SecureConnectionFailed
        } else if err.is_connect() {
            if message.contains("dns error") {
                TransportErrorKind::CannotFindHost
            } else {
                TransportErrorKind::CannotConnectToHost
            }
        } else if err.is_redirect() {
            TransportErrorKind::TooManyRedirects
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::NetworkConnectionLost
        } else if err.is_builder() {
            TransportErrorKind::Other
        } else if err.is_request() {
            TransportErrorKind::NetworkConnectionLost
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, message)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::from(&err)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => TransportErrorKind::TimedOut,
            io::ErrorKind::ConnectionRefused => TransportErrorKind::CannotConnectToHost,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportErrorKind::NetworkConnectionLost,
            _ => TransportErrorKind::FileSystem,
        };
        Self::new(kind, err.to_string())
    }
}

fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn chain_contains_tls_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = current {
        if inner.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io_err) = inner.downcast_ref::<io::Error>()
            && io_err
                .get_ref()
                .is_some_and(|e| e.downcast_ref::<rustls::Error>().is_some())
        {
            return true;
        }
        current = inner.source();
    }
    false
}

/// Why a response failed validation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// The status code was outside the acceptable set.
    #[error("response status code {0} was unacceptable")]
    UnacceptableStatusCode(u16),
    /// The response MIME type did not match any acceptable type.
    #[error("response content type `{response}` was unacceptable, expected one of {acceptable:?}")]
    UnacceptableContentType {
        /// MIME types that would have been accepted.
        acceptable: Vec<String>,
        /// MIME type the server returned.
        response: String,
    },
    /// The response carried no Content-Type but one was required.
    #[error("response content type was missing, expected one of {acceptable:?}")]
    MissingContentType {
        /// MIME types that would have been accepted.
        acceptable: Vec<String>,
    },
    /// A custom validator rejected the response.
    #[error("{0}")]
    Custom(String),
}

/// Why a server trust evaluation rejected a host.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServerTrustFailure {
    /// Every host must be evaluated and no policy covers this one.
    #[error("no server trust policy found for host `{host}`")]
    NoPolicyForHost {
        /// Evaluated host.
        host: String,
    },
    /// The server presented no certificates.
    #[error("no certificates presented by `{host}`")]
    NoCertificatesFound {
        /// Evaluated host.
        host: String,
    },
    /// Standard chain or hostname validation failed.
    #[error("default evaluation failed for host `{host}`: {reason}")]
    DefaultEvaluationFailed {
        /// Evaluated host.
        host: String,
        /// Validation error detail.
        reason: String,
    },
    /// No pinned certificate matched the presented chain.
    #[error("certificate pinning failed for host `{host}`")]
    CertificatePinningFailed {
        /// Evaluated host.
        host: String,
    },
    /// No pinned public key matched the presented chain.
    #[error("public key pinning failed for host `{host}`")]
    PublicKeyPinningFailed {
        /// Evaluated host.
        host: String,
    },
    /// A custom evaluation rejected the host.
    #[error("custom evaluation failed for host `{host}`")]
    CustomEvaluationFailed {
        /// Evaluated host.
        host: String,
    },
}

impl ServerTrustFailure {
    /// The host that failed evaluation.
    pub fn host(&self) -> &str {
        match self {
            Self::NoPolicyForHost { host }
            | Self::NoCertificatesFound { host }
            | Self::DefaultEvaluationFailed { host, .. }
            | Self::CertificatePinningFailed { host }
            | Self::PublicKeyPinningFailed { host }
            | Self::CustomEvaluationFailed { host } => host,
        }
    }
}

/// Errors produced by courier requests.
#[derive(Clone, Debug, Error)]
pub enum CourierError {
    /// The request URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Parameters could not be encoded into the request.
    #[error("parameter encoding failed: {0}")]
    ParameterEncodingFailed(String),

    /// A multipart form could not be encoded.
    #[error("multipart encoding failed: {0}")]
    MultipartEncodingFailed(String),

    /// A request adapter rejected the request.
    #[error("request adaptation failed: {0}")]
    RequestAdaptationFailed(#[source] Box<CourierError>),

    /// The retrier itself failed while deciding on a retry.
    #[error("request retry failed with retry error: {retry_error}, original error: {original}")]
    RequestRetryFailed {
        /// Error produced by the retrier.
        retry_error: Box<CourierError>,
        /// Error that triggered the retry decision.
        original: Box<CourierError>,
    },

    /// The transport could not create a task for the request.
    #[error("task creation failed: {0}")]
    TaskCreationFailed(String),

    /// The transport failed while executing the request.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Server trust evaluation rejected the connection.
    #[error("server trust evaluation failed: {0}")]
    ServerTrustEvaluationFailed(#[from] ServerTrustFailure),

    /// A validator rejected the response.
    #[error("response validation failed: {0}")]
    ResponseValidationFailed(#[from] ValidationFailure),

    /// A downloaded file could not be moved to its destination.
    #[error("download destination `{}` failed: {message}", path.display())]
    DownloadDestinationFailed {
        /// Destination the file was being moved to.
        path: PathBuf,
        /// Underlying I/O error kind.
        kind: io::ErrorKind,
        /// Underlying I/O error detail.
        message: String,
    },

    /// A certificate or key could not be loaded.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A response handler could not decode the response.
    #[error("response serialization failed: {0}")]
    ResponseSerializationFailed(String),

    /// A local file operation failed.
    #[error("I/O error: {message}")]
    Io {
        /// Underlying I/O error kind.
        kind: io::ErrorKind,
        /// Underlying I/O error detail.
        message: String,
    },

    /// The owning session was dropped before the request could finish.
    #[error("session was deinitialized")]
    SessionDeinitialized,

    /// The request was explicitly cancelled.
    #[error("request was explicitly cancelled")]
    ExplicitlyCancelled,
}

impl CourierError {
    /// Whether the request was explicitly cancelled.
    pub fn is_explicitly_cancelled(&self) -> bool {
        matches!(self, Self::ExplicitlyCancelled)
    }

    /// Whether server trust evaluation failed.
    pub fn is_server_trust_evaluation_error(&self) -> bool {
        matches!(self, Self::ServerTrustEvaluationFailed(_))
    }

    /// Whether a response validator rejected the response.
    pub fn is_response_validation_error(&self) -> bool {
        matches!(self, Self::ResponseValidationFailed(_))
    }

    /// Whether the error came from the transport.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The status code when validation rejected it.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            Self::ResponseValidationFailed(ValidationFailure::UnacceptableStatusCode(code)) => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// The transport failure kind, looking through adaptation and retry wrappers.
    pub fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport(err) => Some(err.kind),
            Self::RequestAdaptationFailed(inner) => inner.transport_error_kind(),
            Self::RequestRetryFailed { original, .. } => original.transport_error_kind(),
            _ => None,
        }
    }

    /// The server trust failure, if this is one.
    pub fn server_trust_failure(&self) -> Option<&ServerTrustFailure> {
        match self {
            Self::ServerTrustEvaluationFailed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Whether a later error may replace this one on a request.
    ///
    /// Cancellation and server trust failures describe the root cause and
    /// are never replaced by the generic error a transport reports afterwards.
    pub(crate) fn is_sticky(&self) -> bool {
        self.is_explicitly_cancelled() || self.is_server_trust_evaluation_error()
    }
}

impl From<url::ParseError> for CourierError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseSerializationFailed(err.to_string())
    }
}

impl From<reqwest::Error> for CourierError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(TransportError::from(&err))
    }
}

impl From<io::Error> for CourierError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<http::header::InvalidHeaderName> for CourierError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::ParameterEncodingFailed(format!("invalid header name: {err}"))
    }
}

impl From<http::header::InvalidHeaderValue> for CourierError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::ParameterEncodingFailed(format!("invalid header value: {err}"))
    }
}

/// A specialized Result type for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(CourierError::ExplicitlyCancelled.is_explicitly_cancelled());
        assert!(
            CourierError::from(ServerTrustFailure::CertificatePinningFailed {
                host: "example.com".into()
            })
            .is_server_trust_evaluation_error()
        );

        let validation = CourierError::from(ValidationFailure::UnacceptableStatusCode(404));
        assert!(validation.is_response_validation_error());
        assert_eq!(validation.response_code(), Some(404));
        assert_eq!(CourierError::ExplicitlyCancelled.response_code(), None);
    }

    #[test]
    fn test_transport_kind_through_wrappers() {
        let lost = CourierError::from(TransportError::new(
            TransportErrorKind::NetworkConnectionLost,
            "reset",
        ));
        assert_eq!(
            lost.transport_error_kind(),
            Some(TransportErrorKind::NetworkConnectionLost)
        );

        let adapted = CourierError::RequestAdaptationFailed(Box::new(lost));
        assert_eq!(
            adapted.transport_error_kind(),
            Some(TransportErrorKind::NetworkConnectionLost)
        );
        assert_eq!(CourierError::SessionDeinitialized.transport_error_kind(), None);
    }

    #[test]
    fn test_sticky_errors() {
        assert!(CourierError::ExplicitlyCancelled.is_sticky());
        assert!(
            CourierError::from(ServerTrustFailure::NoPolicyForHost {
                host: "a".into()
            })
            .is_sticky()
        );
        assert!(!CourierError::from(TransportError::cancelled()).is_sticky());
    }

    #[test]
    fn test_io_conversion() {
        let err = CourierError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        match err {
            CourierError::Io { kind, .. } => assert_eq!(kind, io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }

        let transport = TransportError::from(io::Error::new(io::ErrorKind::ConnectionReset, "x"));
        assert_eq!(transport.kind, TransportErrorKind::NetworkConnectionLost);
    }

    #[test]
    fn test_display() {
        let err = CourierError::from(url::Url::parse("not a url").unwrap_err());
        assert!(err.to_string().starts_with("invalid URL"));
        assert_eq!(
            ServerTrustFailure::PublicKeyPinningFailed {
                host: "h".into()
            }
            .host(),
            "h"
        );
    }
}
