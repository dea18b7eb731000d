//! Request adaptation and retry decisions.
//!
//! An adapter rewrites each [`UrlRequest`] before a task is created for it
//! (adding auth headers, rewriting hosts), or fails the attempt. A retrier
//! is consulted whenever a task ends in error and decides whether, and
//! after what delay, the request is resubmitted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CourierError, Result};
use crate::http::UrlRequest;
use crate::request::{Request, RequestId};

/// What an adapter knows about the attempt it adapts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdaptState {
    /// The request being adapted.
    pub request_id: RequestId,
    /// Retries so far; 0 for the first attempt.
    pub retry_count: u32,
}

/// The outcome of a retry decision.
#[derive(Clone, Debug)]
pub enum RetryResult {
    /// Resubmit immediately.
    Retry,
    /// Resubmit after the delay.
    RetryWithDelay(Duration),
    /// Finish with the current error.
    DoNotRetry,
    /// Finish, reporting that deciding failed with this error.
    DoNotRetryWithError(CourierError),
}

impl RetryResult {
    /// Whether the request will be resubmitted.
    pub fn retry_required(&self) -> bool {
        matches!(self, Self::Retry | Self::RetryWithDelay(_))
    }

    /// The delay before resubmission, if retrying.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry => Some(Duration::ZERO),
            Self::RetryWithDelay(delay) => Some(*delay),
            Self::DoNotRetry | Self::DoNotRetryWithError(_) => None,
        }
    }
}

/// Rewrites requests before they are sent.
#[async_trait]
pub trait RequestAdapter: Send + Sync {
    /// Adapt `request`, or fail the attempt. The default passes it through.
    async fn adapt(&self, request: UrlRequest, state: &AdaptState) -> Result<UrlRequest> {
        let _ = state;
        Ok(request)
    }
}

/// Decides whether failed requests are retried.
#[async_trait]
pub trait RequestRetrier: Send + Sync {
    /// Decide for `request`, which failed with `error`. The default never retries.
    async fn retry(&self, request: &Request, error: &CourierError) -> RetryResult {
        let _ = (request, error);
        RetryResult::DoNotRetry
    }
}

/// Both an adapter and a retrier.
pub trait RequestInterceptor: RequestAdapter + RequestRetrier {}

impl<T: RequestAdapter + RequestRetrier> RequestInterceptor for T {}

type AdaptFn = dyn Fn(UrlRequest, &AdaptState) -> Result<UrlRequest> + Send + Sync;
type RetryFn = dyn Fn(&Request, &CourierError) -> RetryResult + Send + Sync;

/// An adapter from a closure.
#[derive(Clone)]
pub struct Adapter(Arc<AdaptFn>);

impl Adapter {
    /// Wrap `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(UrlRequest, &AdaptState) -> Result<UrlRequest> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Adapter")
    }
}

#[async_trait]
impl RequestAdapter for Adapter {
    async fn adapt(&self, request: UrlRequest, state: &AdaptState) -> Result<UrlRequest> {
        (self.0)(request, state)
    }
}

#[async_trait]
impl RequestRetrier for Adapter {}

/// A retrier from a closure.
#[derive(Clone)]
pub struct Retrier(Arc<RetryFn>);

impl Retrier {
    /// Wrap `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Request, &CourierError) -> RetryResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Retrier")
    }
}

#[async_trait]
impl RequestRetrier for Retrier {
    async fn retry(&self, request: &Request, error: &CourierError) -> RetryResult {
        (self.0)(request, error)
    }
}

#[async_trait]
impl RequestAdapter for Retrier {}

/// A chain of adapters and retriers.
///
/// Adapters run in order, each seeing the previous one's output; the first
/// failure aborts. Retriers are asked in order; the first answer other than
/// [`RetryResult::DoNotRetry`] wins.
#[derive(Clone, Default)]
pub struct Interceptor {
    adapters: Vec<Arc<dyn RequestAdapter>>,
    retriers: Vec<Arc<dyn RequestRetrier>>,
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("adapters", &self.adapters.len())
            .field("retriers", &self.retriers.len())
            .finish()
    }
}

impl Interceptor {
    /// Compose `adapters` and `retriers`.
    pub fn new(
        adapters: Vec<Arc<dyn RequestAdapter>>,
        retriers: Vec<Arc<dyn RequestRetrier>>,
    ) -> Self {
        Self { adapters, retriers }
    }

    /// Append an adapter.
    pub fn adapter(mut self, adapter: impl RequestAdapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    /// Append a retrier.
    pub fn retrier(mut self, retrier: impl RequestRetrier + 'static) -> Self {
        self.retriers.push(Arc::new(retrier));
        self
    }

    /// Append something that is both.
    pub fn interceptor<I: RequestInterceptor + 'static>(mut self, interceptor: I) -> Self {
        let interceptor = Arc::new(interceptor);
        self.adapters.push(interceptor.clone());
        self.retriers.push(interceptor);
        self
    }
}

#[async_trait]
impl RequestAdapter for Interceptor {
    async fn adapt(&self, mut request: UrlRequest, state: &AdaptState) -> Result<UrlRequest> {
        for adapter in &self.adapters {
            request = adapter.adapt(request, state).await?;
        }
        Ok(request)
    }
}

#[async_trait]
impl RequestRetrier for Interceptor {
    async fn retry(&self, request: &Request, error: &CourierError) -> RetryResult {
        for retrier in &self.retriers {
            match retrier.retry(request, error).await {
                RetryResult::DoNotRetry => continue,
                decision => return decision,
            }
        }
        RetryResult::DoNotRetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use crate::request::KindState;
    use crate::signal::Signal;
    use std::sync::Weak;
    use tokio::runtime::Handle;

    fn state() -> AdaptState {
        AdaptState {
            request_id: RequestId::next(),
            retry_count: 0,
        }
    }

    fn request() -> Request {
        let convertible: Arc<dyn crate::http::UrlRequestConvertible> =
            Arc::new(UrlRequest::parse(HttpMethod::Get, "https://retry.test/").unwrap());
        Request::new(
            KindState::data(),
            convertible,
            Weak::new(),
            Arc::new(Signal::new()),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_adapters_run_in_order() {
        let interceptor = Interceptor::default()
            .adapter(Adapter::new(|request, _| request.with_header("X-Step", "one")))
            .adapter(Adapter::new(|request, state| {
                assert_eq!(request.header("x-step"), Some("one"));
                request.with_header("X-Attempt", &state.retry_count.to_string())
            }));

        let request = UrlRequest::parse(HttpMethod::Get, "https://api.test/").unwrap();
        let adapted = interceptor.adapt(request, &state()).await.unwrap();
        assert_eq!(adapted.header("x-attempt"), Some("0"));
    }

    #[tokio::test]
    async fn test_first_adapter_failure_aborts() {
        let interceptor = Interceptor::default()
            .adapter(Adapter::new(|_, _| Err(CourierError::InvalidUrl("nope".into()))))
            .adapter(Adapter::new(|_, _| panic!("must not run")));

        let request = UrlRequest::parse(HttpMethod::Get, "https://api.test/").unwrap();
        let err = interceptor.adapt(request, &state()).await.unwrap_err();
        assert!(matches!(err, CourierError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_first_retry_answer_wins() {
        let interceptor = Interceptor::default()
            .retrier(Retrier::new(|_, _| RetryResult::DoNotRetry))
            .retrier(Retrier::new(|_, _| RetryResult::RetryWithDelay(Duration::from_secs(3))))
            .retrier(Retrier::new(|_, _| RetryResult::Retry));

        let decision = interceptor
            .retry(&request(), &CourierError::ExplicitlyCancelled)
            .await;
        assert_eq!(decision.delay(), Some(Duration::from_secs(3)));

        let empty = Interceptor::default();
        let decision = empty.retry(&request(), &CourierError::ExplicitlyCancelled).await;
        assert!(!decision.retry_required());
    }
}
