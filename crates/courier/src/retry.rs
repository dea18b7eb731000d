//! Ready-made retriers with exponential backoff.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CourierError, TransportErrorKind};
use crate::http::HttpMethod;
use crate::interceptor::{RequestAdapter, RequestRetrier, RetryResult};
use crate::logging::targets;
use crate::request::Request;

/// Default number of retries.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Default exponential backoff base.
pub const DEFAULT_EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Default exponential backoff scale, in seconds.
pub const DEFAULT_EXPONENTIAL_BACKOFF_SCALE: f64 = 0.5;

/// Methods retried by default: the idempotent ones.
pub const DEFAULT_RETRYABLE_METHODS: [HttpMethod; 6] = [
    HttpMethod::Delete,
    HttpMethod::Get,
    HttpMethod::Head,
    HttpMethod::Options,
    HttpMethod::Put,
    HttpMethod::Trace,
];

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 5] = [408, 500, 502, 503, 504];

/// Transport failures retried by default.
pub const DEFAULT_RETRYABLE_ERROR_KINDS: [TransportErrorKind; 8] = [
    TransportErrorKind::CannotConnectToHost,
    TransportErrorKind::CannotFindHost,
    TransportErrorKind::DnsLookupFailed,
    TransportErrorKind::NetworkConnectionLost,
    TransportErrorKind::NotConnectedToInternet,
    TransportErrorKind::TimedOut,
    TransportErrorKind::BadServerResponse,
    TransportErrorKind::SecureConnectionFailed,
];

/// Retries idempotent requests that failed with a transient status code or
/// transport error, waiting `scale * base^retry_count` seconds between
/// attempts.
///
/// A status code only counts once a validator turned it into an error, so
/// pair this policy with [`Request::validate`].
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    retry_limit: u32,
    exponential_backoff_base: u32,
    exponential_backoff_scale: f64,
    retryable_methods: HashSet<HttpMethod>,
    retryable_status_codes: HashSet<u16>,
    retryable_error_kinds: HashSet<TransportErrorKind>,
    respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            exponential_backoff_base: DEFAULT_EXPONENTIAL_BACKOFF_BASE,
            exponential_backoff_scale: DEFAULT_EXPONENTIAL_BACKOFF_SCALE,
            retryable_methods: DEFAULT_RETRYABLE_METHODS.into_iter().collect(),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            retryable_error_kinds: DEFAULT_RETRYABLE_ERROR_KINDS.into_iter().collect(),
            respect_retry_after: false,
        }
    }
}

impl RetryPolicy {
    /// The default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of retries.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Backoff base. Values below 2 are raised to 2.
    pub fn exponential_backoff_base(mut self, base: u32) -> Self {
        self.exponential_backoff_base = base.max(2);
        self
    }

    /// Backoff scale in seconds.
    pub fn exponential_backoff_scale(mut self, scale: f64) -> Self {
        self.exponential_backoff_scale = scale;
        self
    }

    /// Replace the retryable methods.
    pub fn retryable_methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.retryable_methods = methods.into_iter().collect();
        self
    }

    /// Replace the retryable status codes.
    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the retryable transport failures.
    pub fn retryable_error_kinds(mut self, kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    /// Wait at least as long as the response's `Retry-After` asks.
    pub fn respecting_retry_after(mut self) -> Self {
        self.respect_retry_after = true;
        self
    }

    /// The configured retry limit.
    pub fn limit(&self) -> u32 {
        self.retry_limit
    }

    /// Backoff before retry number `retry_count + 1`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let seconds =
            f64::from(self.exponential_backoff_base).powi(exponent) * self.exponential_backoff_scale;
        if seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Whether `request`, failed with `error`, qualifies for a retry,
    /// ignoring the retry limit.
    pub fn should_retry(&self, request: &Request, error: &CourierError) -> bool {
        let Some(method) = request.request().map(|r| r.method) else {
            return false;
        };
        if !self.retryable_methods.contains(&method) {
            return false;
        }

        if let Some(status) = request.http_response().map(|r| r.status)
            && self.retryable_status_codes.contains(&status)
        {
            return true;
        }

        error
            .transport_error_kind()
            .is_some_and(|kind| self.retryable_error_kinds.contains(&kind))
    }
}

#[async_trait]
impl RequestRetrier for RetryPolicy {
    async fn retry(&self, request: &Request, error: &CourierError) -> RetryResult {
        let retry_count = request.retry_count();
        if retry_count >= self.retry_limit || !self.should_retry(request, error) {
            debug!(
                target: targets::RETRY,
                request = %request.id(),
                retry_count,
                error = %error,
                "not retrying"
            );
            return RetryResult::DoNotRetry;
        }

        let mut delay = self.delay(retry_count);
        if self.respect_retry_after
            && let Some(retry_after) = request.http_response().and_then(|r| r.retry_after())
        {
            delay = delay.max(retry_after);
        }
        debug!(
            target: targets::RETRY,
            request = %request.id(),
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying"
        );
        RetryResult::RetryWithDelay(delay)
    }
}

#[async_trait]
impl RequestAdapter for RetryPolicy {}

/// Retries idempotent requests only when the connection was lost.
#[derive(Clone, Debug)]
pub struct ConnectionLostRetryPolicy {
    policy: RetryPolicy,
}

impl Default for ConnectionLostRetryPolicy {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default()
                .retryable_status_codes([])
                .retryable_error_kinds([TransportErrorKind::NetworkConnectionLost]),
        }
    }
}

impl ConnectionLostRetryPolicy {
    /// The default connection-lost policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of retries.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.policy = self.policy.retry_limit(limit);
        self
    }

    /// Backoff base. Values below 2 are raised to 2.
    pub fn exponential_backoff_base(mut self, base: u32) -> Self {
        self.policy = self.policy.exponential_backoff_base(base);
        self
    }

    /// Backoff scale in seconds.
    pub fn exponential_backoff_scale(mut self, scale: f64) -> Self {
        self.policy = self.policy.exponential_backoff_scale(scale);
        self
    }

    /// Replace the retryable methods.
    pub fn retryable_methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.policy = self.policy.retryable_methods(methods);
        self
    }

    /// The underlying policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl RequestRetrier for ConnectionLostRetryPolicy {
    async fn retry(&self, request: &Request, error: &CourierError) -> RetryResult {
        self.policy.retry(request, error).await
    }
}

#[async_trait]
impl RequestAdapter for ConnectionLostRetryPolicy {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::http::{HttpResponse, UrlRequest, UrlRequestConvertible};
    use crate::request::KindState;
    use crate::signal::Signal;
    use crate::transport::TaskId;
    use http::{HeaderMap, HeaderValue};
    use std::sync::{Arc, Weak};
    use tokio::runtime::Handle;

    fn attempted(method: HttpMethod, status: Option<u16>, retry_after: Option<&'static str>) -> Request {
        let url_request = UrlRequest::parse(method, "https://retry.test/items").unwrap();
        let convertible: Arc<dyn UrlRequestConvertible> = Arc::new(url_request.clone());
        let request = Request::new(
            KindState::data(),
            convertible,
            Weak::new(),
            Arc::new(Signal::new()),
            Handle::current(),
        );
        request.did_create_url_request(url_request.clone());
        request.did_create_task(TaskId::next());
        if let Some(status) = status {
            let mut headers = HeaderMap::new();
            if let Some(value) = retry_after {
                headers.insert("retry-after", HeaderValue::from_static(value));
            }
            request.did_receive_response(HttpResponse::new(status, headers, url_request.url));
        }
        request
    }

    fn lost() -> CourierError {
        TransportError::new(TransportErrorKind::NetworkConnectionLost, "reset").into()
    }

    fn validation(code: u16) -> CourierError {
        crate::ValidationFailure::UnacceptableStatusCode(code).into()
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(policy.delay(u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_retryable_status_and_method() {
        let policy = RetryPolicy::default();

        let get = attempted(HttpMethod::Get, Some(503), None);
        assert!(policy.should_retry(&get, &validation(503)));

        let post = attempted(HttpMethod::Post, Some(503), None);
        assert!(!policy.should_retry(&post, &validation(503)));

        let not_found = attempted(HttpMethod::Get, Some(404), None);
        assert!(!policy.should_retry(&not_found, &validation(404)));
    }

    #[tokio::test]
    async fn test_retryable_error_kinds() {
        let policy = RetryPolicy::default();
        let get = attempted(HttpMethod::Get, None, None);
        assert!(policy.should_retry(&get, &lost()));
        assert!(!policy.should_retry(&get, &CourierError::ExplicitlyCancelled));

        let adapted = CourierError::RequestAdaptationFailed(Box::new(lost()));
        assert!(policy.should_retry(&get, &adapted));
    }

    #[tokio::test]
    async fn test_retry_limit() {
        let policy = RetryPolicy::default();
        let request = attempted(HttpMethod::Get, Some(500), None);
        assert!(policy.retry(&request, &validation(500)).await.retry_required());

        request.prepare_for_retry();
        request.prepare_for_retry();
        assert_eq!(request.retry_count(), 2);
        assert!(!policy.retry(&request, &validation(500)).await.retry_required());
    }

    #[tokio::test]
    async fn test_enormous_backoff_saturates() {
        let policy = RetryPolicy::default().exponential_backoff_scale(f64::MAX);
        let request = attempted(HttpMethod::Get, Some(503), None);
        let result = policy.retry(&request, &validation(503)).await;
        assert_eq!(result.delay(), Some(Duration::MAX));
    }

    #[tokio::test]
    async fn test_retry_after() {
        let request = attempted(HttpMethod::Get, Some(503), Some("2"));

        let plain = RetryPolicy::default().retry(&request, &validation(503)).await;
        assert_eq!(plain.delay(), Some(Duration::from_millis(500)));

        let respecting = RetryPolicy::default()
            .respecting_retry_after()
            .retry(&request, &validation(503))
            .await;
        assert_eq!(respecting.delay(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_connection_lost_policy() {
        let policy = ConnectionLostRetryPolicy::default();
        let request = attempted(HttpMethod::Get, Some(503), None);
        assert!(!policy.retry(&request, &validation(503)).await.retry_required());

        let request = attempted(HttpMethod::Get, None, None);
        assert!(policy.retry(&request, &lost()).await.retry_required());

        let timed_out = TransportError::new(TransportErrorKind::TimedOut, "slow").into();
        assert!(!policy.retry(&request, &timed_out).await.retry_required());
    }
}
