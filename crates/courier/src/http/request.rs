//! URL request values and the conversions that produce them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::encoding::{ParameterEncoder, Parameters, UrlEncoding};
use crate::error::{CourierError, Result};

/// HTTP request methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method.
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP DELETE method.
    Delete,
    /// HTTP PATCH method.
    Patch,
    /// HTTP HEAD method.
    Head,
    /// HTTP OPTIONS method.
    Options,
    /// HTTP TRACE method.
    Trace,
    /// HTTP CONNECT method.
    Connect,
}

impl HttpMethod {
    /// The method token as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    /// Whether repeating the request has no additional effect on the server.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Put | Self::Delete | Self::Options | Self::Trace
        )
    }

    /// Whether URL-encoded parameters belong in the query string by default.
    pub(crate) fn encodes_parameters_in_url(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Delete)
    }

    /// Convert to reqwest method.
    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
            Self::Trace => reqwest::Method::TRACE,
            Self::Connect => reqwest::Method::CONNECT,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "TRACE" => Ok(Self::Trace),
            "CONNECT" => Ok(Self::Connect),
            other => Err(CourierError::ParameterEncodingFailed(format!(
                "unsupported HTTP method `{other}`"
            ))),
        }
    }
}

/// A fully described HTTP request, ready to hand to a transport.
#[derive(Clone, Debug, PartialEq)]
pub struct UrlRequest {
    /// The HTTP method.
    pub method: HttpMethod,
    /// The request URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// In-memory body, if any.
    pub body: Option<Bytes>,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
}

impl UrlRequest {
    /// Create a request with no headers and no body.
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Parse `url` and create a request for it.
    pub fn parse(method: HttpMethod, url: &str) -> Result<Self> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// Set a header, replacing any existing value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    /// Set a header in place, replacing any existing value.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Look up a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set the in-memory body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The URL host, if the URL has one.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// Types that can be turned into a URL.
pub trait UrlConvertible {
    /// Produce the URL, failing with [`CourierError::InvalidUrl`].
    fn as_url(&self) -> Result<Url>;
}

impl UrlConvertible for Url {
    fn as_url(&self) -> Result<Url> {
        Ok(self.clone())
    }
}

impl UrlConvertible for str {
    fn as_url(&self) -> Result<Url> {
        Ok(Url::parse(self)?)
    }
}

impl UrlConvertible for String {
    fn as_url(&self) -> Result<Url> {
        self.as_str().as_url()
    }
}

/// Types that can build a [`UrlRequest`].
///
/// Requests keep their convertible and call it again for every attempt, so
/// a retried request is rebuilt from scratch before being adapted again.
pub trait UrlRequestConvertible: Send + Sync {
    /// Build the request.
    fn as_url_request(&self) -> Result<UrlRequest>;
}

impl UrlRequestConvertible for UrlRequest {
    fn as_url_request(&self) -> Result<UrlRequest> {
        Ok(self.clone())
    }
}

impl UrlRequestConvertible for Url {
    fn as_url_request(&self) -> Result<UrlRequest> {
        Ok(UrlRequest::new(HttpMethod::Get, self.clone()))
    }
}

impl UrlRequestConvertible for String {
    fn as_url_request(&self) -> Result<UrlRequest> {
        UrlRequest::parse(HttpMethod::Get, self)
    }
}

impl UrlRequestConvertible for &'static str {
    fn as_url_request(&self) -> Result<UrlRequest> {
        UrlRequest::parse(HttpMethod::Get, self)
    }
}

/// The pieces of a request: URL, method, headers, and encoded parameters.
///
/// This is what the [`Session`](crate::Session) convenience methods build.
#[derive(Clone)]
pub struct RequestParts {
    url: String,
    method: HttpMethod,
    headers: HeaderMap,
    parameters: Option<Parameters>,
    encoder: Arc<dyn ParameterEncoder>,
    timeout: Option<Duration>,
}

impl RequestParts {
    /// Describe a request without parameters.
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            parameters: None,
            encoder: Arc::new(UrlEncoding::default()),
            timeout: None,
        }
    }

    /// Add headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set parameters and the encoder that applies them.
    pub fn parameters(
        mut self,
        parameters: Parameters,
        encoder: impl ParameterEncoder + 'static,
    ) -> Self {
        self.parameters = Some(parameters);
        self.encoder = Arc::new(encoder);
        self
    }

    /// Set a per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for RequestParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestParts")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl UrlRequestConvertible for RequestParts {
    fn as_url_request(&self) -> Result<UrlRequest> {
        let mut request = UrlRequest::new(self.method, self.url.as_url()?);
        request.headers = self.headers.clone();
        request.timeout = self.timeout;
        self.encoder.encode(request, self.parameters.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_round_trip_and_idempotence() {
        assert_eq!("delete".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!("BREW".parse::<HttpMethod>().is_err());
        assert!(HttpMethod::Put.is_idempotent());
        assert!(!HttpMethod::Post.is_idempotent());
        assert!(!HttpMethod::Patch.is_idempotent());
        assert_eq!(HttpMethod::Trace.to_string(), "TRACE");
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let err = RequestParts::new("::not a url::", HttpMethod::Get)
            .as_url_request()
            .unwrap_err();
        assert!(matches!(err, CourierError::InvalidUrl(_)));
    }

    #[test]
    fn test_request_parts_builds_query() {
        let mut params = Parameters::new();
        params.insert("page".into(), json!(2));

        let request = RequestParts::new("https://example.com/items", HttpMethod::Get)
            .parameters(params, UrlEncoding::default())
            .as_url_request()
            .unwrap();
        assert_eq!(request.url.query(), Some("page=2"));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_headers() {
        let request = UrlRequest::parse(HttpMethod::Get, "https://example.com")
            .unwrap()
            .with_header("Accept", "application/json")
            .unwrap();
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.host(), Some("example.com"));
        assert!(request.clone().with_header("bad header", "x").is_err());
    }
}
