//! HTTP response types.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use crate::error::CourierError;
use crate::request::ResumeData;

use super::request::UrlRequest;

/// Status line and headers of an HTTP response.
///
/// The body is delivered separately, through the request that received it.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// The URL that produced this response, after redirects.
    pub url: Url,
}

impl HttpResponse {
    /// Create a response head.
    pub fn new(status: u16, headers: HeaderMap, url: Url) -> Self {
        Self {
            status,
            headers,
            url,
        }
    }

    /// Create from a reqwest response, leaving the body unread.
    pub(crate) fn from_reqwest(response: &reqwest::Response) -> Self {
        Self {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            url: response.url().clone(),
        }
    }

    /// Check if the response indicates success (2xx status).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if the response is a redirect (3xx status).
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Check if the response is a client error (4xx status).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if the response is a server error (5xx status).
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the Content-Type header value.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// The MIME type from the Content-Type header, lowercased, without parameters.
    pub fn mime_type(&self) -> Option<String> {
        self.content_type()
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().to_ascii_lowercase())
            .filter(|mime| !mime.is_empty())
    }

    /// Get the Content-Length header value.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// How long the server asked clients to wait, from `Retry-After`.
    ///
    /// Only the delta-seconds form is understood.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// A file name for saving the body: the Content-Disposition filename,
    /// else the last URL path segment, else `download`.
    pub fn suggested_filename(&self) -> String {
        if let Some(name) = self
            .header("content-disposition")
            .and_then(filename_from_disposition)
        {
            return name;
        }

        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "download".to_string())
    }
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|param| {
        let rest = param.strip_prefix("filename=")?;
        let name = rest.trim_matches('"');
        let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Progress information for downloads/uploads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Number of bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total number of bytes, if known.
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Create a progress value.
    pub fn new(bytes_transferred: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
        }
    }

    /// Get the progress as a fraction (0.0 to 1.0), if total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.bytes_transferred as f64 / total as f64
            }
        })
    }

    /// Get the progress as a percentage (0 to 100), if total is known.
    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0).min(100.0) as u8)
    }

    /// Whether every expected byte has been transferred.
    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_transferred >= total)
    }
}

/// The outcome of a data or upload request, as seen by a response handler.
#[derive(Clone, Debug)]
pub struct DataResponse<T> {
    /// The last request sent.
    pub request: Option<UrlRequest>,
    /// The response head, if one was received.
    pub response: Option<HttpResponse>,
    /// The accumulated body.
    pub data: Option<Bytes>,
    /// The decoded value or the error the request ended with.
    pub result: Result<T, CourierError>,
    /// How many times the request was retried.
    pub retry_count: u32,
}

impl<T> DataResponse<T> {
    /// The decoded value, if the request succeeded.
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// The error, if the request failed.
    pub fn error(&self) -> Option<&CourierError> {
        self.result.as_ref().err()
    }

    /// Response status code, if a response was received.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// Transform the decoded value, keeping the rest.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataResponse<U> {
        DataResponse {
            request: self.request,
            response: self.response,
            data: self.data,
            result: self.result.map(f),
            retry_count: self.retry_count,
        }
    }
}

/// The outcome of a download request.
#[derive(Clone, Debug)]
pub struct DownloadResponse<T> {
    /// The last request sent.
    pub request: Option<UrlRequest>,
    /// The response head, if one was received.
    pub response: Option<HttpResponse>,
    /// Where the downloaded file was placed.
    pub file_url: Option<PathBuf>,
    /// Data for resuming the download, when it was cancelled part way.
    pub resume_data: Option<ResumeData>,
    /// The decoded value or the error the request ended with.
    pub result: Result<T, CourierError>,
    /// How many times the request was retried.
    pub retry_count: u32,
}

impl<T> DownloadResponse<T> {
    /// The decoded value, if the request succeeded.
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// The error, if the request failed.
    pub fn error(&self) -> Option<&CourierError> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(status: u16, headers: &[(&'static str, &'static str)], url: &str) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        HttpResponse::new(status, map, Url::parse(url).unwrap())
    }

    #[test]
    fn test_status_classes() {
        assert!(response(204, &[], "https://a.test").is_success());
        assert!(response(301, &[], "https://a.test").is_redirect());
        assert!(response(404, &[], "https://a.test").is_client_error());
        assert!(response(503, &[], "https://a.test").is_server_error());
    }

    #[test]
    fn test_mime_type_and_retry_after() {
        let r = response(
            503,
            &[
                ("content-type", "Application/JSON; charset=utf-8"),
                ("retry-after", "7"),
                ("content-length", "12"),
            ],
            "https://a.test",
        );
        assert_eq!(r.mime_type().as_deref(), Some("application/json"));
        assert_eq!(r.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(r.content_length(), Some(12));

        let dated = response(503, &[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")], "https://a.test");
        assert_eq!(dated.retry_after(), None);
    }

    #[test]
    fn test_suggested_filename() {
        let disposition = response(
            200,
            &[("content-disposition", "attachment; filename=\"../report.pdf\"")],
            "https://a.test/files/1",
        );
        assert_eq!(disposition.suggested_filename(), "report.pdf");
        assert_eq!(
            response(200, &[], "https://a.test/files/archive.zip").suggested_filename(),
            "archive.zip"
        );
        assert_eq!(response(200, &[], "https://a.test/").suggested_filename(), "download");
    }

    #[test]
    fn test_transfer_progress() {
        let half = TransferProgress::new(50, Some(100));
        assert_eq!(half.fraction(), Some(0.5));
        assert_eq!(half.percent(), Some(50));
        assert!(!half.is_complete());
        assert!(TransferProgress::new(0, Some(0)).is_complete());
        assert_eq!(TransferProgress::new(10, None).fraction(), None);
    }
}
