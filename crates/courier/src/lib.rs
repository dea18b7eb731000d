//! Request lifecycle orchestration for HTTP clients.
//!
//! courier sits between application code and an HTTP transport. A
//! [`Session`] turns each call into a [`Request`] that may span several
//! transport tasks: it builds and adapts the URL request, creates a task,
//! routes every transport callback back to the request, runs validators,
//! and consults a retry policy before the request finishes.
//!
//! - **Requests** have their own run state (`resume`, `suspend`, `cancel`)
//!   independent of the task currently carrying them.
//! - **Interceptors** rewrite outgoing requests and decide retries; see
//!   [`RetryPolicy`] for exponential backoff with `Retry-After` support.
//! - **Server trust** is evaluated per host by a [`ServerTrustManager`],
//!   with certificate and public key pinning.
//! - **Transports** are pluggable. [`ReqwestTransport`] is the default.
//!
//! # Data requests
//!
//! ```ignore
//! use courier::Session;
//! use courier::http::HttpMethod;
//!
//! let session = Session::new()?;
//!
//! let response = session
//!     .request("https://api.example.com/users", HttpMethod::Get)
//!     .validate()
//!     .json::<Vec<User>>()
//!     .await;
//!
//! match response.result {
//!     Ok(users) => println!("{} users", users.len()),
//!     Err(err) => eprintln!("request failed: {err}"),
//! }
//! ```
//!
//! # Retries
//!
//! ```ignore
//! use courier::{RetryPolicy, Session};
//!
//! let session = Session::builder()
//!     .interceptor(RetryPolicy::default().respecting_retry_after())
//!     .build()?;
//! ```
//!
//! # Downloads
//!
//! ```ignore
//! use courier::request::{DownloadOptions, destination};
//!
//! let target = destination(|_, response| {
//!     (
//!         PathBuf::from("/tmp/downloads").join(response.suggested_filename()),
//!         DownloadOptions::new().create_intermediate_directories(),
//!     )
//! });
//! let download = session.download("https://example.com/big.iso", Some(target));
//!
//! // Later: keep what arrived so far.
//! download.cancel_producing_resume_data();
//! let partial = download.file().await;
//! if let Some(resume) = partial.resume_data {
//!     let resumed = session.download_resuming(resume, None);
//! }
//! ```
//!
//! # Server trust
//!
//! ```ignore
//! use courier::{ServerTrustManager, ServerTrustPolicy, Session};
//!
//! let manager = ServerTrustManager::new([(
//!     "api.example.com",
//!     ServerTrustPolicy::pin_certificates(vec![pinned_cert]),
//! )])
//! .allow_unlisted_hosts();
//!
//! let session = Session::builder().server_trust_manager(manager).build()?;
//! ```
//!
//! # Events
//!
//! ```ignore
//! session.events().connect(|event| {
//!     if let RequestEvent::Finished { id, error } = event {
//!         println!("{id} finished: {error:?}");
//!     }
//! });
//! ```

pub mod auth;
mod error;
pub mod http;
pub mod interceptor;
pub mod logging;
pub mod redirect;
pub mod request;
pub mod retry;
pub mod runtime;
mod session;
pub mod signal;
mod task_map;
pub mod tls;
pub mod transport;
pub mod trust;

pub use error::{
    CourierError, Result, ServerTrustFailure, TransportError, TransportErrorKind, ValidationFailure,
};

// Re-export commonly used types at the crate root
pub use auth::{ChallengeDisposition, Credential};
pub use http::{DataResponse, DownloadResponse, HttpMethod, HttpResponse, TransferProgress, UrlRequest};
pub use interceptor::{Adapter, Interceptor, RequestAdapter, RequestInterceptor, RequestRetrier, Retrier, RetryResult};
pub use redirect::{RedirectHandler, Redirector};
pub use request::{
    DataRequest, DownloadRequest, Request, RequestEvent, RequestId, RequestState, UploadRequest,
};
pub use retry::{ConnectionLostRetryPolicy, RetryPolicy};
pub use session::{Session, SessionBuilder, SessionConfiguration};
pub use transport::ReqwestTransport;
pub use trust::{ServerTrustManager, ServerTrustPolicy};
