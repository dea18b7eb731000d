//! HTTP value types: methods, URL requests, parameter encoding, multipart
//! bodies, and responses.
//!
//! Nothing here performs I/O on the network; these are the values a
//! [`Session`](crate::Session) builds and a [`Transport`](crate::transport::Transport)
//! executes.
//!
//! ```ignore
//! use courier::http::{HttpMethod, JsonEncoding, RequestParts};
//!
//! let parts = RequestParts::new("https://api.example.com/users", HttpMethod::Post)
//!     .parameters(serde_json::json!({"name": "John"}).as_object().cloned().unwrap(), JsonEncoding::default());
//! let request = session.request_convertible(parts);
//! ```

mod encoding;
mod multipart;
mod request;
mod response;

pub use encoding::{
    ArrayEncoding, BoolEncoding, JsonEncoding, ParameterEncoder, Parameters, UrlEncoding,
    UrlEncodingDestination,
};
pub use multipart::{DEFAULT_ENCODING_MEMORY_THRESHOLD, MultipartFormData, mime_type_for_path};
pub use request::{HttpMethod, RequestParts, UrlConvertible, UrlRequest, UrlRequestConvertible};
pub use response::{DataResponse, DownloadResponse, HttpResponse, TransferProgress};
