//! Requests: the caller's handle on one logical HTTP exchange.
//!
//! A [`Request`] outlives the transport tasks that carry it. Each attempt
//! (the first one, and every retry) gets a fresh task; the request keeps
//! the list of tasks it has owned, its run state, the error it will finish
//! with, and the validators and response handlers registered on it.
//!
//! State changes made by the caller are applied here under the request's
//! lock and then forwarded to the session's root queue, which owns the task
//! and acts on it. Everything the transport reports arrives the other way,
//! from the root queue into the request.
//!
//! Response handlers are held on a per-request completion queue until the
//! request finishes, then run one at a time in registration order.
//!
//! ```ignore
//! let request = session.request("https://httpbin.org/get", HttpMethod::Get);
//! let response = request.validate().data().await;
//! ```

mod download;
mod event;
mod state;
mod upload;
mod validation;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tempfile::TempPath;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::auth::Credential;
use crate::error::{CourierError, Result, TransportError, TransportErrorKind};
use crate::http::{DataResponse, DownloadResponse, HttpResponse, TransferProgress, UrlRequest, UrlRequestConvertible};
use crate::logging::targets;
use crate::redirect::RedirectHandler;
use crate::session::{RootMessage, SessionShared, StateChange};
use crate::signal::Signal;
use crate::transport::{BodyStream, TaskId, TaskKind};

use download::move_to_destination;
pub use download::{
    Destination, DownloadOptions, ResumeData, destination, suggested_download_destination,
};
pub use event::{RequestEvent, RequestId};
pub use state::RequestState;
use upload::{UploadState, create_uploadable};
pub use upload::UploadSource;
pub use validation::{ValidationContext, Validator};

/// A progress callback.
pub type ProgressHandler = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

type CompletionJob = Box<dyn FnOnce() + Send>;

/// The kind of transfer a request performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Response body loaded into memory.
    Data,
    /// Response body streamed to a file.
    Download,
    /// Request body sent from memory, a file, a stream, or a multipart form.
    Upload,
}

pub(crate) struct DownloadState {
    destination: Option<Destination>,
    resume_from: Option<ResumeData>,
    resume_data: Option<ResumeData>,
    file_url: Option<PathBuf>,
}

impl DownloadState {
    pub(crate) fn new(destination: Option<Destination>, resume_from: Option<ResumeData>) -> Self {
        Self {
            destination,
            resume_from,
            resume_data: None,
            file_url: None,
        }
    }
}

/// Per-kind state, resolved once when the request is created.
pub(crate) enum KindState {
    Data { data: BytesMut },
    Download(DownloadState),
    Upload { data: BytesMut, upload: UploadState },
}

impl KindState {
    pub(crate) fn data() -> Self {
        Self::Data {
            data: BytesMut::new(),
        }
    }

    pub(crate) fn download(destination: Option<Destination>, resume_from: Option<ResumeData>) -> Self {
        Self::Download(DownloadState::new(destination, resume_from))
    }

    pub(crate) fn upload(source: UploadSource) -> Self {
        Self::Upload {
            data: BytesMut::new(),
            upload: UploadState::new(source),
        }
    }

    fn kind(&self) -> RequestKind {
        match self {
            Self::Data { .. } => RequestKind::Data,
            Self::Download(_) => RequestKind::Download,
            Self::Upload { .. } => RequestKind::Upload,
        }
    }

    fn data_mut(&mut self) -> Option<&mut BytesMut> {
        match self {
            Self::Data { data } | Self::Upload { data, .. } => Some(data),
            Self::Download(_) => None,
        }
    }

    fn body(&self) -> Option<&BytesMut> {
        match self {
            Self::Data { data } | Self::Upload { data, .. } => Some(data),
            Self::Download(_) => None,
        }
    }
}

struct MutableState {
    state: RequestState,
    finished: bool,
    requests: Vec<UrlRequest>,
    tasks: Vec<TaskId>,
    retry_count: u32,
    response: Option<HttpResponse>,
    error: Option<CourierError>,
    validators: Vec<Validator>,
    credential: Option<Credential>,
    redirect_handler: Option<Arc<dyn RedirectHandler>>,
    upload_progress: TransferProgress,
    download_progress: TransferProgress,
    upload_progress_handlers: Vec<ProgressHandler>,
    download_progress_handlers: Vec<ProgressHandler>,
    kind: KindState,
}

enum CompletionQueue {
    Held(Vec<CompletionJob>),
    Released(mpsc::UnboundedSender<CompletionJob>),
}

struct RequestInner {
    id: RequestId,
    kind: RequestKind,
    convertible: Arc<dyn UrlRequestConvertible>,
    session: Weak<SessionShared>,
    events: Arc<Signal<RequestEvent>>,
    runtime: Handle,
    state: Mutex<MutableState>,
    completion: Mutex<CompletionQueue>,
}

/// A logical HTTP exchange, possibly spanning several transport tasks.
///
/// Cheap to clone; clones share state. Equality and hashing use the
/// request's [`RequestId`].
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &state.state)
            .field("finished", &state.finished)
            .field("tasks", &state.tasks)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(
        kind: KindState,
        convertible: Arc<dyn UrlRequestConvertible>,
        session: Weak<SessionShared>,
        events: Arc<Signal<RequestEvent>>,
        runtime: Handle,
    ) -> Self {
        let inner = RequestInner {
            id: RequestId::next(),
            kind: kind.kind(),
            convertible,
            session,
            events,
            runtime,
            state: Mutex::new(MutableState {
                state: RequestState::Initialized,
                finished: false,
                requests: Vec::new(),
                tasks: Vec::new(),
                retry_count: 0,
                response: None,
                error: None,
                validators: Vec::new(),
                credential: None,
                redirect_handler: None,
                upload_progress: TransferProgress::default(),
                download_progress: TransferProgress::default(),
                upload_progress_handlers: Vec::new(),
                download_progress_handlers: Vec::new(),
                kind,
            }),
            completion: Mutex::new(CompletionQueue::Held(Vec::new())),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    /// Stable identity of this request.
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// What kind of transfer this is.
    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    /// Current run state.
    pub fn state(&self) -> RequestState {
        self.inner.state.lock().state
    }

    /// Whether the request has not been resumed, suspended or cancelled yet.
    pub fn is_initialized(&self) -> bool {
        self.state() == RequestState::Initialized
    }

    /// Whether the request is resumed.
    pub fn is_resumed(&self) -> bool {
        self.state() == RequestState::Resumed
    }

    /// Whether the request is suspended.
    pub fn is_suspended(&self) -> bool {
        self.state() == RequestState::Suspended
    }

    /// Whether the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    /// Whether the request has finished. A finished request never changes again.
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// How many times the request has been retried.
    ///
    /// Counts resubmissions, including those that failed before a task was
    /// created.
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }

    /// The most recent URL request sent.
    pub fn request(&self) -> Option<UrlRequest> {
        self.inner.state.lock().requests.last().cloned()
    }

    /// The first URL request built.
    pub fn first_request(&self) -> Option<UrlRequest> {
        self.inner.state.lock().requests.first().cloned()
    }

    /// Every URL request built, in order.
    pub fn requests(&self) -> Vec<UrlRequest> {
        self.inner.state.lock().requests.clone()
    }

    /// The current (last) transport task.
    pub fn task(&self) -> Option<TaskId> {
        self.inner.state.lock().tasks.last().copied()
    }

    /// Every transport task this request has owned, in order.
    pub fn tasks(&self) -> Vec<TaskId> {
        self.inner.state.lock().tasks.clone()
    }

    /// The response head of the current attempt.
    pub fn http_response(&self) -> Option<HttpResponse> {
        self.inner.state.lock().response.clone()
    }

    /// The error the request has accumulated so far.
    pub fn error(&self) -> Option<CourierError> {
        self.inner.state.lock().error.clone()
    }

    /// The credential set with [`authenticate`](Self::authenticate).
    pub fn credential(&self) -> Option<Credential> {
        self.inner.state.lock().credential.clone()
    }

    /// Request body progress.
    pub fn upload_progress(&self) -> TransferProgress {
        self.inner.state.lock().upload_progress.clone()
    }

    /// Response body progress.
    pub fn download_progress(&self) -> TransferProgress {
        self.inner.state.lock().download_progress.clone()
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    /// Resume the request, creating its task first if needed.
    pub fn resume(&self) -> &Self {
        if self.transition(RequestState::Resumed) {
            self.emit(RequestEvent::Resumed { id: self.id() });
            self.notify(StateChange::Resume);
        }
        self
    }

    /// Suspend the request.
    pub fn suspend(&self) -> &Self {
        if self.transition(RequestState::Suspended) {
            self.emit(RequestEvent::Suspended { id: self.id() });
            self.notify(StateChange::Suspend);
        }
        self
    }

    /// Cancel the request.
    ///
    /// The request finishes with [`CourierError::ExplicitlyCancelled`] and is
    /// never retried. Calls after the first, or after the request finished,
    /// do nothing.
    pub fn cancel(&self) -> &Self {
        self.cancel_request(false);
        self
    }

    fn cancel_request(&self, produce_resume_data: bool) {
        if self.transition(RequestState::Cancelled) {
            self.emit(RequestEvent::Cancelled { id: self.id() });
            self.notify(StateChange::Cancel {
                produce_resume_data,
            });
        }
    }

    fn transition(&self, next: RequestState) -> bool {
        let mut state = self.inner.state.lock();
        let current = state.state;
        if state.finished || !current.can_transition_to(next) {
            debug!(
                target: targets::REQUEST,
                request = %self.inner.id,
                from = %current,
                to = %next,
                finished = state.finished,
                "state transition rejected"
            );
            return false;
        }

        state.state = next;
        if next == RequestState::Cancelled
            && !state
                .error
                .as_ref()
                .is_some_and(CourierError::is_server_trust_evaluation_error)
        {
            state.error = Some(CourierError::ExplicitlyCancelled);
        }
        debug!(target: targets::REQUEST, request = %self.inner.id, from = %current, to = %next, "state transition");
        true
    }

    fn notify(&self, change: StateChange) {
        let delivered = self.inner.session.upgrade().is_some_and(|shared| {
            shared.send(RootMessage::StateChanged {
                request: self.clone(),
                change,
            })
        });
        if delivered {
            return;
        }

        debug!(target: targets::REQUEST, request = %self.inner.id, ?change, "session is gone");
        if matches!(change, StateChange::Cancel { .. }) {
            self.finish();
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Validate with the default rules: status 200..=299 and, when the
    /// request sends `Accept`, a matching `Content-Type`.
    pub fn validate(&self) -> &Self {
        self.add_validator(validation::default_validator())
    }

    /// Register a custom validator.
    pub fn validate_with<F>(&self, validator: F) -> &Self
    where
        F: Fn(&ValidationContext<'_>) -> std::result::Result<(), crate::ValidationFailure>
            + Send
            + Sync
            + 'static,
    {
        self.add_validator(Arc::new(validator))
    }

    /// Require the status code to fall in `acceptable`.
    pub fn validate_status<R>(&self, acceptable: R) -> &Self
    where
        R: RangeBounds<u16> + Send + Sync + 'static,
    {
        self.add_validator(validation::status_code(acceptable))
    }

    /// Require the response MIME type to match one of `acceptable`.
    /// `type/*` and `*/*` wildcards are honoured.
    pub fn validate_content_type<I, S>(&self, acceptable: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let acceptable = acceptable.into_iter().map(|s| s.into().to_ascii_lowercase()).collect();
        self.add_validator(validation::content_type(acceptable))
    }

    fn add_validator(&self, validator: Validator) -> &Self {
        self.inner.state.lock().validators.push(validator);
        self
    }

    /// Answer HTTP authentication challenges with `credential`.
    pub fn authenticate(&self, credential: Credential) -> &Self {
        self.inner.state.lock().credential = Some(credential);
        self
    }

    /// Handle redirects of this request with `handler` instead of the
    /// session's handler.
    pub fn redirect<H>(&self, handler: H) -> &Self
    where
        H: RedirectHandler + 'static,
    {
        self.inner.state.lock().redirect_handler = Some(Arc::new(handler));
        self
    }

    /// Call `handler` whenever request body progress changes.
    pub fn on_upload_progress<F>(&self, handler: F) -> &Self
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .upload_progress_handlers
            .push(Arc::new(handler));
        self
    }

    /// Call `handler` whenever response body progress changes.
    pub fn on_download_progress<F>(&self, handler: F) -> &Self
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .download_progress_handlers
            .push(Arc::new(handler));
        self
    }

    // ------------------------------------------------------------------
    // Root queue callbacks
    // ------------------------------------------------------------------

    fn emit(&self, event: RequestEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn redirect_handler(&self) -> Option<Arc<dyn RedirectHandler>> {
        self.inner.state.lock().redirect_handler.clone()
    }

    /// Build the URL request and task kind for the next attempt.
    ///
    /// Runs off the root queue: an upload's multipart form may be encoded
    /// to disk here.
    pub(crate) fn build_task_request(&self, threshold: u64, temp_dir: &Path) -> Result<(UrlRequest, TaskKind)> {
        let mut url_request = self.inner.convertible.as_url_request()?;

        let source = {
            let mut state = self.inner.state.lock();
            match &mut state.kind {
                KindState::Data { .. } => return Ok((url_request, TaskKind::Data)),
                KindState::Download(download) => {
                    if download
                        .resume_from
                        .as_ref()
                        .is_some_and(|resume| !resume.partial_file.exists())
                    {
                        debug!(target: targets::REQUEST, request = %self.inner.id, "partial file gone, downloading from the start");
                        download.resume_from = None;
                    }
                    let resume_data = download.resume_from.clone();
                    if let Some(resume) = &resume_data {
                        url_request.set_header("Range", &resume.range_header())?;
                        if let Some(validator) = resume.if_range() {
                            url_request.set_header("If-Range", validator)?;
                        }
                    }
                    return Ok((url_request, TaskKind::Download { resume_data }));
                }
                KindState::Upload { upload, .. } => {
                    if let Some(kind) = upload.apply_to(&mut url_request)? {
                        return Ok((url_request, kind));
                    }
                    upload.take_source()
                }
            }
        };

        let source = source.ok_or_else(|| {
            CourierError::TaskCreationFailed("upload body is no longer available".into())
        })?;
        let resolved = create_uploadable(source, threshold, temp_dir)?;

        let mut state = self.inner.state.lock();
        let KindState::Upload { upload, .. } = &mut state.kind else {
            return Ok((url_request, TaskKind::Data));
        };
        upload.store(resolved);
        let kind = upload.apply_to(&mut url_request)?.unwrap_or(TaskKind::Data);
        Ok((url_request, kind))
    }

    pub(crate) fn did_create_url_request(&self, request: UrlRequest) {
        let url = request.url.clone();
        self.inner.state.lock().requests.push(request);
        self.emit(RequestEvent::UrlRequestCreated { id: self.id(), url });
    }

    pub(crate) fn did_create_task(&self, task: TaskId) {
        self.inner.state.lock().tasks.push(task);
        debug!(target: targets::REQUEST, request = %self.inner.id, task = %task, "task created");
        self.emit(RequestEvent::TaskCreated { id: self.id(), task });
    }

    pub(crate) fn did_receive_response(&self, response: HttpResponse) {
        let mut state = self.inner.state.lock();
        state.download_progress.total_bytes = response.content_length();
        state.response = Some(response);
    }

    pub(crate) fn did_receive_data(&self, chunk: Bytes) {
        let (progress, handlers) = {
            let mut state = self.inner.state.lock();
            let Some(data) = state.kind.data_mut() else {
                return;
            };
            data.extend_from_slice(&chunk);
            let received = data.len() as u64;
            state.download_progress.bytes_transferred = received;
            (
                state.download_progress.clone(),
                state.download_progress_handlers.clone(),
            )
        };
        self.report_download_progress(progress, handlers);
    }

    pub(crate) fn did_write_data(&self, total_written: u64, total_expected: Option<u64>) {
        let (progress, handlers) = {
            let mut state = self.inner.state.lock();
            state.download_progress = TransferProgress::new(total_written, total_expected);
            (
                state.download_progress.clone(),
                state.download_progress_handlers.clone(),
            )
        };
        self.report_download_progress(progress, handlers);
    }

    pub(crate) fn did_send_body_data(&self, total_sent: u64, total_expected: Option<u64>) {
        let progress = TransferProgress::new(total_sent, total_expected);
        let handlers = {
            let mut state = self.inner.state.lock();
            state.upload_progress = progress.clone();
            state.upload_progress_handlers.clone()
        };
        for handler in &handlers {
            handler(&progress);
        }
        self.emit(RequestEvent::UploadProgress {
            id: self.id(),
            progress,
        });
    }

    fn report_download_progress(&self, progress: TransferProgress, handlers: Vec<ProgressHandler>) {
        for handler in &handlers {
            handler(&progress);
        }
        self.emit(RequestEvent::DownloadProgress {
            id: self.id(),
            progress,
        });
    }

    /// Move a finished download into place. Failures become the request's error.
    pub(crate) fn did_finish_downloading(&self, file: TempPath) {
        let (destination, response) = {
            let state = self.inner.state.lock();
            let KindState::Download(download) = &state.kind else {
                return;
            };
            (download.destination.clone(), state.response.clone())
        };

        let outcome = match (destination, response) {
            (_, None) => Err(CourierError::Transport(TransportError::new(
                TransportErrorKind::BadServerResponse,
                "download finished without a response",
            ))),
            (None, Some(_)) => file.keep().map_err(|err| CourierError::from(err.error)),
            (Some(destination), Some(response)) => {
                let (path, options) = destination(&file, &response);
                move_to_destination(file, &path, options)
            }
        };

        match outcome {
            Ok(path) => {
                debug!(target: targets::REQUEST, request = %self.inner.id, path = %path.display(), "download moved into place");
                if let KindState::Download(download) = &mut self.inner.state.lock().kind {
                    download.file_url = Some(path);
                }
            }
            Err(err) => {
                warn!(target: targets::REQUEST, request = %self.inner.id, error = %err, "download destination failed");
                self.record_error(err);
            }
        }
    }

    pub(crate) fn did_produce_resume_data(&self, resume_data: ResumeData) {
        if let KindState::Download(download) = &mut self.inner.state.lock().kind {
            download.resume_data = Some(resume_data);
        }
    }

    /// Whether this is an upload whose body is a stream.
    pub(crate) fn is_stream_upload(&self) -> bool {
        matches!(&self.inner.state.lock().kind, KindState::Upload { upload, .. } if upload.is_stream())
    }

    pub(crate) fn take_upload_stream(&self) -> Option<BodyStream> {
        match &mut self.inner.state.lock().kind {
            KindState::Upload { upload, .. } => upload.take_stream(),
            _ => None,
        }
    }

    /// Attach `error`, unless the request already carries a cancellation or
    /// trust failure.
    pub(crate) fn record_error(&self, error: CourierError) {
        let mut state = self.inner.state.lock();
        match &state.error {
            Some(existing) if existing.is_sticky() => {
                debug!(
                    target: targets::REQUEST,
                    request = %self.inner.id,
                    kept = %existing,
                    ignored = %error,
                    "keeping earlier error"
                );
            }
            _ => state.error = Some(error),
        }
    }

    /// Run validators once, stopping at the first failure.
    ///
    /// Skipped when the request already failed or never got a response.
    pub(crate) fn run_validators(&self) {
        let (validators, request, response, data) = {
            let state = self.inner.state.lock();
            let Some(response) = state.response.clone() else {
                return;
            };
            if state.error.is_some() || state.validators.is_empty() {
                return;
            }
            let data = state.kind.body().map(|data| Bytes::copy_from_slice(data));
            (
                state.validators.clone(),
                state.requests.last().cloned(),
                response,
                data,
            )
        };

        let ctx = ValidationContext {
            request: request.as_ref(),
            response: &response,
            data: data.as_ref(),
        };
        if let Some(failure) = validators.iter().find_map(|validate| validate(&ctx).err()) {
            debug!(target: targets::REQUEST, request = %self.inner.id, %failure, "validation failed");
            self.record_error(failure.into());
        }
    }

    /// Clear the outcome of the previous attempt.
    pub(crate) fn prepare_for_retry(&self) {
        let mut state = self.inner.state.lock();
        state.retry_count = state.retry_count.saturating_add(1);
        if state.state != RequestState::Cancelled {
            state.error = None;
        }
        state.response = None;
        state.upload_progress = TransferProgress::default();
        state.download_progress = TransferProgress::default();
        match &mut state.kind {
            KindState::Data { data } | KindState::Upload { data, .. } => data.clear(),
            KindState::Download(download) => {
                download.resume_data = None;
                download.file_url = None;
            }
        }
    }

    /// Mark the request finished and release its response handlers.
    ///
    /// Returns `false` if it had already finished.
    pub(crate) fn finish(&self) -> bool {
        let (error, uploadable) = {
            let mut state = self.inner.state.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            let uploadable = match &state.kind {
                KindState::Upload { upload, .. } => upload.uploadable().cloned(),
                _ => None,
            };
            (state.error.clone(), uploadable)
        };

        if let Some(uploadable) = uploadable {
            uploadable.cleanup();
        }

        match &error {
            Some(err) => debug!(target: targets::REQUEST, request = %self.inner.id, error = %err, "request finished"),
            None => debug!(target: targets::REQUEST, request = %self.inner.id, "request finished"),
        }
        self.emit(RequestEvent::Finished {
            id: self.id(),
            error,
        });
        self.release_completion_queue();
        true
    }

    // ------------------------------------------------------------------
    // Completion queue
    // ------------------------------------------------------------------

    fn enqueue(&self, job: CompletionJob) {
        let rejected = {
            let mut queue = self.inner.completion.lock();
            match &mut *queue {
                CompletionQueue::Held(jobs) => {
                    jobs.push(job);
                    None
                }
                CompletionQueue::Released(sender) => sender.send(job).err().map(|err| err.0),
            }
        };
        // The runtime is gone; run in place rather than drop the handler.
        if let Some(job) = rejected {
            job();
        }
    }

    fn release_completion_queue(&self) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<CompletionJob>();
        {
            let mut queue = self.inner.completion.lock();
            let CompletionQueue::Held(jobs) = &mut *queue else {
                return;
            };
            for job in jobs.drain(..) {
                let _ = sender.send(job);
            }
            *queue = CompletionQueue::Released(sender);
        }

        let id = self.inner.id;
        self.inner.runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    warn!(target: targets::REQUEST, request = %id, error = %err, "response handler panicked");
                }
            }
        });
    }

    fn data_response<T>(&self, serialize: impl FnOnce(Bytes) -> Result<T>) -> DataResponse<T> {
        let (request, response, data, error, retry_count) = {
            let state = self.inner.state.lock();
            let data = state.kind.body().map(|data| Bytes::copy_from_slice(data));
            (
                state.requests.last().cloned(),
                state.response.clone(),
                data,
                state.error.clone(),
                state.retry_count,
            )
        };
        let data = data.filter(|data| !data.is_empty() || response.is_some());
        let result = match error {
            Some(err) => Err(err),
            None => serialize(data.clone().unwrap_or_default()),
        };
        DataResponse {
            request,
            response,
            data,
            result,
            retry_count,
        }
    }

    fn download_response(&self) -> DownloadResponse<PathBuf> {
        let state = self.inner.state.lock();
        let (file_url, resume_data) = match &state.kind {
            KindState::Download(download) => (download.file_url.clone(), download.resume_data.clone()),
            _ => (None, None),
        };
        let result = match (&state.error, &file_url) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(path)) => Ok(path.clone()),
            (None, None) => Err(CourierError::ResponseSerializationFailed(
                "no file was downloaded".into(),
            )),
        };
        DownloadResponse {
            request: state.requests.last().cloned(),
            response: state.response.clone(),
            file_url,
            resume_data,
            result,
            retry_count: state.retry_count,
        }
    }
}

fn decode_string(data: Bytes) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|err| CourierError::ResponseSerializationFailed(err.to_string()))
}

fn decode_json<T: DeserializeOwned>(data: Bytes) -> Result<T> {
    if data.is_empty() {
        return Err(CourierError::ResponseSerializationFailed(
            "response body was empty".into(),
        ));
    }
    Ok(serde_json::from_slice(&data)?)
}

/// Chainable wrappers for the [`Request`] methods that return `&Self`, so
/// calls keep the subtype: `session.download(..).resume().response_file(..)`.
macro_rules! chainable_request_methods {
    ($ty:ty) => {
        impl $ty {
            /// See [`Request::resume`].
            pub fn resume(&self) -> &Self {
                self.as_request().resume();
                self
            }

            /// See [`Request::suspend`].
            pub fn suspend(&self) -> &Self {
                self.as_request().suspend();
                self
            }

            /// See [`Request::cancel`].
            pub fn cancel(&self) -> &Self {
                self.as_request().cancel();
                self
            }

            /// See [`Request::validate`].
            pub fn validate(&self) -> &Self {
                self.as_request().validate();
                self
            }

            /// See [`Request::validate_with`].
            pub fn validate_with<F>(&self, validator: F) -> &Self
            where
                F: Fn(&ValidationContext<'_>) -> std::result::Result<(), crate::ValidationFailure>
                    + Send
                    + Sync
                    + 'static,
            {
                self.as_request().validate_with(validator);
                self
            }

            /// See [`Request::validate_status`].
            pub fn validate_status<R>(&self, acceptable: R) -> &Self
            where
                R: RangeBounds<u16> + Send + Sync + 'static,
            {
                self.as_request().validate_status(acceptable);
                self
            }

            /// See [`Request::validate_content_type`].
            pub fn validate_content_type<I, S>(&self, acceptable: I) -> &Self
            where
                I: IntoIterator<Item = S>,
                S: Into<String>,
            {
                self.as_request().validate_content_type(acceptable);
                self
            }

            /// See [`Request::authenticate`].
            pub fn authenticate(&self, credential: Credential) -> &Self {
                self.as_request().authenticate(credential);
                self
            }

            /// See [`Request::redirect`].
            pub fn redirect<H>(&self, handler: H) -> &Self
            where
                H: RedirectHandler + 'static,
            {
                self.as_request().redirect(handler);
                self
            }

            /// See [`Request::on_upload_progress`].
            pub fn on_upload_progress<F>(&self, handler: F) -> &Self
            where
                F: Fn(&TransferProgress) + Send + Sync + 'static,
            {
                self.as_request().on_upload_progress(handler);
                self
            }

            /// See [`Request::on_download_progress`].
            pub fn on_download_progress<F>(&self, handler: F) -> &Self
            where
                F: Fn(&TransferProgress) + Send + Sync + 'static,
            {
                self.as_request().on_download_progress(handler);
                self
            }
        }
    };
}

/// A request whose response body is loaded into memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRequest {
    request: Request,
}

impl DataRequest {
    pub(crate) fn new(request: Request) -> Self {
        Self { request }
    }

    /// The underlying request.
    pub fn as_request(&self) -> &Request {
        &self.request
    }

    /// The body received so far.
    pub fn data_so_far(&self) -> Bytes {
        let state = self.request.inner.state.lock();
        state
            .kind
            .body()
            .map(|data| Bytes::copy_from_slice(data))
            .unwrap_or_default()
    }

    fn response_serialized<T, S, F>(&self, serialize: S, handler: F) -> &Self
    where
        S: FnOnce(Bytes) -> Result<T> + Send + 'static,
        F: FnOnce(DataResponse<T>) + Send + 'static,
    {
        let request = self.request.clone();
        self.request
            .enqueue(Box::new(move || handler(request.data_response(serialize))));
        self
    }

    async fn serialized<T, S>(&self, serialize: S) -> DataResponse<T>
    where
        T: Send + 'static,
        S: FnOnce(Bytes) -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.response_serialized(serialize, move |response| {
            let _ = sender.send(response);
        });
        match receiver.await {
            Ok(response) => response,
            Err(_) => self
                .request
                .data_response(|_| Err(CourierError::SessionDeinitialized)),
        }
    }

    /// Call `handler` with the raw body once the request finishes.
    pub fn response<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<Bytes>) + Send + 'static,
    {
        self.response_serialized(Ok, handler)
    }

    /// Call `handler` with the body decoded as UTF-8.
    pub fn response_string<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<String>) + Send + 'static,
    {
        self.response_serialized(decode_string, handler)
    }

    /// Call `handler` with the body decoded as JSON.
    pub fn response_json<T, F>(&self, handler: F) -> &Self
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(DataResponse<T>) + Send + 'static,
    {
        self.response_serialized(decode_json::<T>, handler)
    }

    /// Wait for the request to finish and return the raw body.
    pub async fn data(&self) -> DataResponse<Bytes> {
        self.serialized(Ok).await
    }

    /// Wait for the request to finish and return the body as UTF-8.
    pub async fn string(&self) -> DataResponse<String> {
        self.serialized(decode_string).await
    }

    /// Wait for the request to finish and return the body decoded as JSON.
    pub async fn json<T>(&self) -> DataResponse<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.serialized(decode_json::<T>).await
    }
}

impl Deref for DataRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}

chainable_request_methods!(DataRequest);

/// A request that sends a body. Its response body is loaded into memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    data: DataRequest,
}

impl UploadRequest {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            data: DataRequest::new(request),
        }
    }

    /// The underlying request.
    pub fn as_request(&self) -> &Request {
        &self.data.request
    }

    /// The request viewed as a data request.
    pub fn as_data_request(&self) -> &DataRequest {
        &self.data
    }

    /// See [`DataRequest::response`].
    pub fn response<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<Bytes>) + Send + 'static,
    {
        self.data.response(handler);
        self
    }

    /// See [`DataRequest::response_string`].
    pub fn response_string<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<String>) + Send + 'static,
    {
        self.data.response_string(handler);
        self
    }

    /// See [`DataRequest::response_json`].
    pub fn response_json<T, F>(&self, handler: F) -> &Self
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(DataResponse<T>) + Send + 'static,
    {
        self.data.response_json(handler);
        self
    }
}

impl Deref for UploadRequest {
    type Target = DataRequest;

    fn deref(&self) -> &DataRequest {
        &self.data
    }
}

chainable_request_methods!(UploadRequest);

/// A request whose response body is streamed to a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    request: Request,
}

impl DownloadRequest {
    pub(crate) fn new(request: Request) -> Self {
        Self { request }
    }

    /// The underlying request.
    pub fn as_request(&self) -> &Request {
        &self.request
    }

    /// Where the finished download was placed.
    pub fn file_url(&self) -> Option<PathBuf> {
        match &self.request.inner.state.lock().kind {
            KindState::Download(download) => download.file_url.clone(),
            _ => None,
        }
    }

    /// Data for continuing this download, produced by
    /// [`cancel_producing_resume_data`](Self::cancel_producing_resume_data).
    pub fn resume_data(&self) -> Option<ResumeData> {
        match &self.request.inner.state.lock().kind {
            KindState::Download(download) => download.resume_data.clone(),
            _ => None,
        }
    }

    /// Cancel, asking the transport for [`ResumeData`] first.
    pub fn cancel_producing_resume_data(&self) -> &Self {
        self.request.cancel_request(true);
        self
    }

    /// Call `handler` with the file location once the request finishes.
    pub fn response_file<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DownloadResponse<PathBuf>) + Send + 'static,
    {
        let request = self.request.clone();
        self.request
            .enqueue(Box::new(move || handler(request.download_response())));
        self
    }

    /// Wait for the request to finish and return the file location.
    pub async fn file(&self) -> DownloadResponse<PathBuf> {
        let (sender, receiver) = oneshot::channel();
        self.response_file(move |response| {
            let _ = sender.send(response);
        });
        match receiver.await {
            Ok(response) => response,
            Err(_) => {
                let mut response = self.request.download_response();
                response.result = Err(CourierError::SessionDeinitialized);
                response
            }
        }
    }
}

impl Deref for DownloadRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}

chainable_request_methods!(DownloadRequest);
