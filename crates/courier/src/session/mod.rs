//! Sessions: the factory for requests and the owner of their coordination.
//!
//! A [`Session`] holds the configuration, the transport, the interceptor,
//! the server trust manager and the session-wide credentials. Every request
//! it creates is handed to a single root queue task, the session delegate,
//! which builds and adapts the request off-queue, creates its transport
//! task, routes every transport callback back to it, and decides on
//! retries. Callers never wait on any of this: the factory methods return a
//! live request immediately.
//!
//! # Example
//!
//! ```ignore
//! use courier::{RetryPolicy, Session};
//! use courier::http::HttpMethod;
//!
//! let session = Session::builder()
//!     .interceptor(RetryPolicy::default())
//!     .build()?;
//!
//! let response = session
//!     .request("https://httpbin.org/get", HttpMethod::Get)
//!     .validate()
//!     .string()
//!     .await;
//! ```
//!
//! Dropping the last handle to a session finishes every request still in
//! flight with [`CourierError::SessionDeinitialized`].

mod delegate;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use rustls::RootCertStore;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::{Credential, CredentialStore};
use crate::error::{CourierError, Result};
use crate::http::{
    DEFAULT_ENCODING_MEMORY_THRESHOLD, HttpMethod, MultipartFormData, ParameterEncoder, Parameters,
    RequestParts, UrlRequest, UrlRequestConvertible,
};
use crate::interceptor::{Interceptor, RequestAdapter, RequestInterceptor, RequestRetrier, RetryResult};
use crate::logging::targets;
use crate::redirect::RedirectHandler;
use crate::request::{
    DataRequest, Destination, DownloadRequest, KindState, Request, RequestEvent, ResumeData,
    UploadRequest, UploadSource,
};
use crate::runtime;
use crate::signal::Signal;
use crate::tls::{Certificate, TlsConfig, TlsVersion};
use crate::transport::{BodyStream, ReqwestTransport, TaskId, TaskKind, Transport, TransportEvent};
use crate::trust::ServerTrustManager;

pub(crate) use delegate::SessionDelegate;

/// Configuration shared by every request of a session.
#[derive(Clone, Debug)]
pub struct SessionConfiguration {
    /// Resume requests as soon as they are created.
    pub start_requests_immediately: bool,
    /// Total timeout of one attempt.
    pub timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Maximum redirects followed by one task.
    pub max_redirects: usize,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Headers added to every request.
    pub default_headers: HeaderMap,
    /// Multipart forms of at least this many bytes are encoded to disk.
    pub multipart_memory_threshold: u64,
    /// Where multipart spill files and download staging files go.
    pub temporary_directory: PathBuf,
    /// TLS settings of the default transport.
    pub tls: TlsConfig,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            start_requests_immediately: true,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HeaderMap::new(),
            multipart_memory_threshold: DEFAULT_ENCODING_MEMORY_THRESHOLD,
            temporary_directory: std::env::temp_dir(),
            tls: TlsConfig::default(),
        }
    }
}

/// Builder for a [`Session`].
pub struct SessionBuilder {
    configuration: SessionConfiguration,
    adapters: Vec<Arc<dyn RequestAdapter>>,
    retriers: Vec<Arc<dyn RequestRetrier>>,
    trust_manager: Option<Arc<ServerTrustManager>>,
    redirect_handler: Option<Arc<dyn RedirectHandler>>,
    credentials: CredentialStore,
    transport: Option<Arc<dyn Transport>>,
    runtime: Option<Handle>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("configuration", &self.configuration)
            .field("adapters", &self.adapters.len())
            .field("retriers", &self.retriers.len())
            .field("trust_manager", &self.trust_manager.is_some())
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            configuration: SessionConfiguration::default(),
            adapters: Vec::new(),
            retriers: Vec::new(),
            trust_manager: None,
            redirect_handler: None,
            credentials: CredentialStore::new(),
            transport: None,
            runtime: None,
        }
    }

    /// Replace the whole configuration.
    pub fn configuration(mut self, configuration: SessionConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Whether requests start as soon as they are created.
    pub fn start_requests_immediately(mut self, start: bool) -> Self {
        self.configuration.start_requests_immediately = start;
        self
    }

    /// Set the timeout of one attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.configuration.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.configuration.connect_timeout = timeout;
        self
    }

    /// Set the maximum number of redirects a task follows.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.configuration.max_redirects = max;
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.configuration.user_agent = user_agent.into();
        self
    }

    /// Add headers sent with every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.configuration.default_headers.extend(headers);
        self
    }

    /// Set the size from which multipart forms are encoded to disk.
    pub fn multipart_memory_threshold(mut self, bytes: u64) -> Self {
        self.configuration.multipart_memory_threshold = bytes;
        self
    }

    /// Set the directory for temporary files.
    pub fn temporary_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration.temporary_directory = path.into();
        self
    }

    /// Set the complete TLS configuration.
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.configuration.tls = tls;
        self
    }

    /// Trust an additional root certificate.
    pub fn add_root_certificate(mut self, certificate: Certificate) -> Self {
        self.configuration.tls.root_certificates.push(certificate);
        self
    }

    /// Set the minimum TLS version.
    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.configuration.tls.min_version = version;
        self
    }

    /// Add an interceptor, used both to adapt and to decide retries.
    ///
    /// Interceptors, adapters and retriers run in the order they were added.
    pub fn interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        let interceptor = Arc::new(interceptor);
        self.adapters.push(interceptor.clone());
        self.retriers.push(interceptor);
        self
    }

    /// Add an adapter.
    pub fn adapter(mut self, adapter: impl RequestAdapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    /// Add a retrier.
    pub fn retrier(mut self, retrier: impl RequestRetrier + 'static) -> Self {
        self.retriers.push(Arc::new(retrier));
        self
    }

    /// Evaluate server trust with `manager`.
    pub fn server_trust_manager(mut self, manager: ServerTrustManager) -> Self {
        self.trust_manager = Some(Arc::new(manager));
        self
    }

    /// Handle redirects of every request not configured otherwise.
    pub fn redirect_handler(mut self, handler: impl RedirectHandler + 'static) -> Self {
        self.redirect_handler = Some(Arc::new(handler));
        self
    }

    /// Answer HTTP challenges from `host` with `credential`.
    pub fn credential(mut self, host: impl Into<String>, credential: Credential) -> Self {
        self.credentials.set(host, credential);
        self
    }

    /// Use a custom transport instead of [`ReqwestTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run the session on `runtime` instead of the current (or fallback) one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the session and start its root queue.
    pub fn build(self) -> Result<Session> {
        let runtime = self.runtime.unwrap_or_else(runtime::handle);

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let _entered = runtime.enter();
                Arc::new(ReqwestTransport::new(
                    &self.configuration,
                    self.trust_manager.clone(),
                )?) as Arc<dyn Transport>
            }
        };

        let trust_roots = Arc::new(self.configuration.tls.build_root_store()?);
        let context = Arc::new(SessionContext {
            configuration: self.configuration,
            transport,
            interceptor: Interceptor::new(self.adapters, self.retriers),
            trust_manager: self.trust_manager,
            trust_roots,
            redirect_handler: self.redirect_handler,
            credentials: self.credentials,
            events: Arc::new(Signal::new()),
            runtime,
        });

        let (root, receiver) = mpsc::unbounded_channel();
        let delegate = SessionDelegate::new(context.clone(), root.downgrade());
        context.runtime.spawn(delegate.run(receiver));

        debug!(
            target: targets::SESSION,
            start_requests_immediately = context.configuration.start_requests_immediately,
            "session created"
        );
        Ok(Session {
            shared: Arc::new(SessionShared { context, root }),
        })
    }
}

/// Read-only state shared by the session handle, the delegate and setup
/// tasks.
pub(crate) struct SessionContext {
    pub(crate) configuration: SessionConfiguration,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interceptor: Interceptor,
    pub(crate) trust_manager: Option<Arc<ServerTrustManager>>,
    /// Anchors for standard validation, from the TLS configuration.
    pub(crate) trust_roots: Arc<RootCertStore>,
    pub(crate) redirect_handler: Option<Arc<dyn RedirectHandler>>,
    pub(crate) credentials: CredentialStore,
    pub(crate) events: Arc<Signal<RequestEvent>>,
    pub(crate) runtime: Handle,
}

/// What a session handle owns. Requests refer to it weakly.
pub(crate) struct SessionShared {
    context: Arc<SessionContext>,
    root: mpsc::UnboundedSender<RootMessage>,
}

impl SessionShared {
    /// Post to the root queue. Fails only once the queue has stopped.
    pub(crate) fn send(&self, message: RootMessage) -> bool {
        self.root.send(message).is_ok()
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let _ = self.root.send(RootMessage::SessionDropped);
    }
}

/// A run-state change requested by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StateChange {
    Resume,
    Suspend,
    Cancel { produce_resume_data: bool },
}

/// Everything the root queue acts on.
pub(crate) enum RootMessage {
    /// A new request.
    Perform(Request),
    /// Setup of an attempt finished.
    UrlRequestReady {
        request: Request,
        result: Result<(UrlRequest, TaskKind)>,
    },
    StateChanged {
        request: Request,
        change: StateChange,
    },
    Transport {
        task: TaskId,
        event: TransportEvent,
    },
    RetryDecided {
        request: Request,
        result: RetryResult,
    },
    /// A retry delay elapsed.
    Resubmit(Request),
    CancelAll,
    SessionDropped,
}

/// Creates and coordinates requests.
///
/// Cheap to clone; clones share the same root queue. When the last clone is
/// dropped, requests still in flight finish with
/// [`CourierError::SessionDeinitialized`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("configuration", &self.shared.context.configuration)
            .finish()
    }
}

impl Session {
    /// Create a session with the default configuration and transport.
    pub fn new() -> Result<Self> {
        SessionBuilder::new().build()
    }

    /// Start configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The session's configuration.
    pub fn configuration(&self) -> &SessionConfiguration {
        &self.shared.context.configuration
    }

    /// Lifecycle events of every request this session creates.
    pub fn events(&self) -> &Signal<RequestEvent> {
        &self.shared.context.events
    }

    /// The server trust manager, if one is configured.
    pub fn server_trust_manager(&self) -> Option<&ServerTrustManager> {
        self.shared.context.trust_manager.as_deref()
    }

    // ------------------------------------------------------------------
    // Data requests
    // ------------------------------------------------------------------

    /// Request `url` with `method`.
    pub fn request(&self, url: impl Into<String>, method: HttpMethod) -> DataRequest {
        self.request_convertible(RequestParts::new(url, method))
    }

    /// Request `url` with `method`, encoding `parameters` with `encoder`
    /// and adding `headers`.
    pub fn request_with(
        &self,
        url: impl Into<String>,
        method: HttpMethod,
        parameters: Option<Parameters>,
        encoder: impl ParameterEncoder + 'static,
        headers: HeaderMap,
    ) -> DataRequest {
        let mut parts = RequestParts::new(url, method).headers(headers);
        if let Some(parameters) = parameters {
            parts = parts.parameters(parameters, encoder);
        }
        self.request_convertible(parts)
    }

    /// Request whatever `convertible` builds.
    pub fn request_convertible(
        &self,
        convertible: impl UrlRequestConvertible + 'static,
    ) -> DataRequest {
        DataRequest::new(self.perform(KindState::data(), Arc::new(convertible)))
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Download `url` with GET, moving the file to `destination`.
    ///
    /// Without a destination the file stays where the transport put it,
    /// under the session's temporary directory.
    pub fn download(&self, url: impl Into<String>, destination: Option<Destination>) -> DownloadRequest {
        self.download_convertible(RequestParts::new(url, HttpMethod::Get), destination)
    }

    /// Download whatever `convertible` builds.
    pub fn download_convertible(
        &self,
        convertible: impl UrlRequestConvertible + 'static,
        destination: Option<Destination>,
    ) -> DownloadRequest {
        DownloadRequest::new(self.perform(
            KindState::download(destination, None),
            Arc::new(convertible),
        ))
    }

    /// Continue a cancelled download from `resume_data`.
    pub fn download_resuming(
        &self,
        resume_data: ResumeData,
        destination: Option<Destination>,
    ) -> DownloadRequest {
        let convertible = UrlRequest::new(HttpMethod::Get, resume_data.url.clone());
        DownloadRequest::new(self.perform(
            KindState::download(destination, Some(resume_data)),
            Arc::new(convertible),
        ))
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Upload `source` with the request `convertible` builds.
    pub fn upload(
        &self,
        source: UploadSource,
        convertible: impl UrlRequestConvertible + 'static,
    ) -> UploadRequest {
        UploadRequest::new(self.perform(KindState::upload(source), Arc::new(convertible)))
    }

    /// Upload `data` to `url`.
    pub fn upload_data(
        &self,
        data: impl Into<Bytes>,
        url: impl Into<String>,
        method: HttpMethod,
    ) -> UploadRequest {
        self.upload(UploadSource::Data(data.into()), RequestParts::new(url, method))
    }

    /// Upload the file at `path` to `url`.
    pub fn upload_file(
        &self,
        path: impl AsRef<Path>,
        url: impl Into<String>,
        method: HttpMethod,
    ) -> UploadRequest {
        self.upload(
            UploadSource::File(path.as_ref().to_path_buf()),
            RequestParts::new(url, method),
        )
    }

    /// Upload a body stream to `url`.
    ///
    /// A streamed body can be sent once; a retry fails to obtain it again.
    pub fn upload_stream(
        &self,
        stream: BodyStream,
        url: impl Into<String>,
        method: HttpMethod,
    ) -> UploadRequest {
        self.upload(UploadSource::Stream(stream), RequestParts::new(url, method))
    }

    /// Upload a multipart form to `url`.
    ///
    /// Forms at or above the session's
    /// [`multipart_memory_threshold`](SessionConfiguration::multipart_memory_threshold)
    /// are encoded to a temporary file first.
    pub fn upload_multipart(
        &self,
        form: MultipartFormData,
        url: impl Into<String>,
        method: HttpMethod,
    ) -> UploadRequest {
        self.upload(UploadSource::Multipart(form), RequestParts::new(url, method))
    }

    // ------------------------------------------------------------------
    // Bulk control
    // ------------------------------------------------------------------

    /// Cancel every request that has not finished.
    pub fn cancel_all_requests(&self) {
        debug!(target: targets::SESSION, "cancelling all requests");
        self.shared.send(RootMessage::CancelAll);
    }

    fn perform(&self, kind: KindState, convertible: Arc<dyn UrlRequestConvertible>) -> Request {
        let context = &self.shared.context;
        let request = Request::new(
            kind,
            convertible,
            Arc::downgrade(&self.shared),
            context.events.clone(),
            context.runtime.clone(),
        );
        debug!(target: targets::SESSION, request = %request.id(), kind = ?request.kind(), "request created");
        context.events.emit(RequestEvent::Created { id: request.id() });

        if !self.shared.send(RootMessage::Perform(request.clone())) {
            request.record_error(CourierError::SessionDeinitialized);
            request.finish();
        }
        request
    }
}
