//! Deferred response validation.
//!
//! Validators are registered on a request and run once, after its task
//! completes without a transport error. The first failure becomes the
//! request's error, and later validators are skipped.

use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ValidationFailure;
use crate::http::{HttpResponse, UrlRequest};

/// What a validator gets to look at.
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext<'a> {
    /// The last request sent.
    pub request: Option<&'a UrlRequest>,
    /// The response head.
    pub response: &'a HttpResponse,
    /// The received body, for data and upload requests.
    pub data: Option<&'a Bytes>,
}

/// A deferred validation closure.
pub type Validator = Arc<dyn Fn(&ValidationContext<'_>) -> Result<(), ValidationFailure> + Send + Sync>;

pub(crate) fn status_code<R>(acceptable: R) -> Validator
where
    R: RangeBounds<u16> + Send + Sync + 'static,
{
    Arc::new(move |ctx| {
        let status = ctx.response.status;
        if acceptable.contains(&status) {
            Ok(())
        } else {
            Err(ValidationFailure::UnacceptableStatusCode(status))
        }
    })
}

pub(crate) fn content_type(acceptable: Vec<String>) -> Validator {
    Arc::new(move |ctx| check_content_type(&acceptable, ctx))
}

/// 2xx status, and a Content-Type matching the request's `Accept` header
/// when it has one.
pub(crate) fn default_validator() -> Validator {
    let status = status_code(200..=299);
    Arc::new(move |ctx| {
        status(ctx)?;
        let accept = ctx
            .request
            .and_then(|request| request.header("accept"))
            .map(parse_accept)
            .unwrap_or_default();
        if accept.is_empty() {
            Ok(())
        } else {
            check_content_type(&accept, ctx)
        }
    })
}

fn check_content_type(acceptable: &[String], ctx: &ValidationContext<'_>) -> Result<(), ValidationFailure> {
    // Nothing to judge without a body.
    if ctx.data.is_none_or(|data| data.is_empty()) {
        return Ok(());
    }

    let Some(response_type) = ctx.response.mime_type() else {
        if acceptable.iter().any(|a| a == "*/*") {
            return Ok(());
        }
        return Err(ValidationFailure::MissingContentType {
            acceptable: acceptable.to_vec(),
        });
    };

    if acceptable
        .iter()
        .any(|candidate| mime_matches(candidate, &response_type))
    {
        Ok(())
    } else {
        Err(ValidationFailure::UnacceptableContentType {
            acceptable: acceptable.to_vec(),
            response: response_type,
        })
    }
}

/// Media ranges from an `Accept` header, without parameters.
pub(crate) fn parse_accept(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|range| range.split(';').next())
        .map(|range| range.trim().to_ascii_lowercase())
        .filter(|range| !range.is_empty())
        .collect()
}

fn split_mime(mime: &str) -> Option<(&str, &str)> {
    let (kind, subtype) = mime.split_once('/')?;
    Some((kind.trim(), subtype.trim()))
}

fn mime_matches(acceptable: &str, response: &str) -> bool {
    let (Some((a_type, a_sub)), Some((r_type, r_sub))) = (split_mime(acceptable), split_mime(response))
    else {
        return false;
    };

    let type_matches = a_type == "*" || a_type.eq_ignore_ascii_case(r_type);
    let subtype_matches = a_sub == "*" || a_sub.eq_ignore_ascii_case(r_sub);
    type_matches && subtype_matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use http::{HeaderMap, HeaderValue};
    use url::Url;

    fn response(status: u16, content_type: Option<&'static str>) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(value) = content_type {
            headers.insert("content-type", HeaderValue::from_static(value));
        }
        HttpResponse::new(status, headers, Url::parse("https://api.test/").unwrap())
    }

    #[test]
    fn test_status_code_validator() {
        let validator = status_code(200..=299);
        let body = Bytes::from_static(b"{}");

        let ok = response(204, None);
        let ctx = ValidationContext { request: None, response: &ok, data: Some(&body) };
        assert!(validator(&ctx).is_ok());

        let missing = response(404, None);
        let ctx = ValidationContext { request: None, response: &missing, data: Some(&body) };
        assert_eq!(validator(&ctx), Err(ValidationFailure::UnacceptableStatusCode(404)));
    }

    #[test]
    fn test_content_type_wildcards() {
        assert!(mime_matches("application/json", "application/json"));
        assert!(mime_matches("application/*", "application/json"));
        assert!(mime_matches("*/*", "image/png"));
        assert!(!mime_matches("text/*", "application/json"));
        assert!(!mime_matches("garbage", "application/json"));
    }

    #[test]
    fn test_content_type_validator() {
        let validator = content_type(vec!["application/json".into()]);
        let body = Bytes::from_static(b"<html/>");

        let html = response(200, Some("text/html; charset=utf-8"));
        let ctx = ValidationContext { request: None, response: &html, data: Some(&body) };
        assert_eq!(
            validator(&ctx),
            Err(ValidationFailure::UnacceptableContentType {
                acceptable: vec!["application/json".into()],
                response: "text/html".into(),
            })
        );

        let untyped = response(200, None);
        let ctx = ValidationContext { request: None, response: &untyped, data: Some(&body) };
        assert!(matches!(validator(&ctx), Err(ValidationFailure::MissingContentType { .. })));

        // Empty bodies are never rejected for their type.
        let ctx = ValidationContext { request: None, response: &html, data: None };
        assert!(validator(&ctx).is_ok());
    }

    #[test]
    fn test_default_validator_uses_accept_header() {
        let validator = default_validator();
        let request = UrlRequest::parse(HttpMethod::Get, "https://api.test/")
            .unwrap()
            .with_header("Accept", "application/json;q=0.9, text/*")
            .unwrap();
        let body = Bytes::from_static(b"x");

        let plain = response(200, Some("text/plain"));
        let ctx = ValidationContext { request: Some(&request), response: &plain, data: Some(&body) };
        assert!(validator(&ctx).is_ok());

        let image = response(200, Some("image/png"));
        let ctx = ValidationContext { request: Some(&request), response: &image, data: Some(&body) };
        assert!(validator(&ctx).is_err());

        let failed = response(500, Some("text/plain"));
        let ctx = ValidationContext { request: None, response: &failed, data: Some(&body) };
        assert_eq!(validator(&ctx), Err(ValidationFailure::UnacceptableStatusCode(500)));
    }

    #[test]
    fn test_parse_accept() {
        assert_eq!(
            parse_accept("Application/JSON; q=1, */*;q=0.1 ,"),
            vec!["application/json".to_string(), "*/*".to_string()]
        );
    }
}
