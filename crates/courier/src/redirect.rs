//! Redirect handling.

use std::fmt;
use std::sync::Arc;

use crate::http::{HttpResponse, UrlRequest};

/// Decides what happens when a server answers with a redirect.
pub trait RedirectHandler: Send + Sync {
    /// Return the request to follow, or `None` to deliver the redirect
    /// response itself.
    fn redirect(
        &self,
        task_request: &UrlRequest,
        new_request: UrlRequest,
        response: &HttpResponse,
    ) -> Option<UrlRequest>;
}

type ModifyFn = Arc<dyn Fn(UrlRequest, &HttpResponse) -> Option<UrlRequest> + Send + Sync>;

/// Ready-made redirect behaviours.
#[derive(Clone)]
pub enum Redirector {
    /// Follow every redirect unchanged.
    Follow,
    /// Never follow; the 3xx response is delivered to the request.
    DoNotFollow,
    /// Rewrite or veto each redirect.
    Modify(ModifyFn),
}

impl Redirector {
    /// Rewrite or veto redirects with `f`.
    pub fn modify<F>(f: F) -> Self
    where
        F: Fn(UrlRequest, &HttpResponse) -> Option<UrlRequest> + Send + Sync + 'static,
    {
        Self::Modify(Arc::new(f))
    }
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follow => f.write_str("Follow"),
            Self::DoNotFollow => f.write_str("DoNotFollow"),
            Self::Modify(_) => f.write_str("Modify"),
        }
    }
}

impl RedirectHandler for Redirector {
    fn redirect(
        &self,
        _task_request: &UrlRequest,
        new_request: UrlRequest,
        response: &HttpResponse,
    ) -> Option<UrlRequest> {
        match self {
            Self::Follow => Some(new_request),
            Self::DoNotFollow => None,
            Self::Modify(f) => f(new_request, response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;

    #[test]
    fn test_redirector_behaviours() {
        let original = UrlRequest::parse(HttpMethod::Get, "https://a.test/old").unwrap();
        let target = UrlRequest::parse(HttpMethod::Get, "https://a.test/new").unwrap();
        let response = HttpResponse::new(302, Default::default(), original.url.clone());

        assert_eq!(
            Redirector::Follow.redirect(&original, target.clone(), &response),
            Some(target.clone())
        );
        assert_eq!(Redirector::DoNotFollow.redirect(&original, target.clone(), &response), None);

        let tagging = Redirector::modify(|request, _| request.with_header("X-Redirected", "1").ok());
        let modified = tagging.redirect(&original, target, &response).unwrap();
        assert_eq!(modified.header("x-redirected"), Some("1"));
    }
}
