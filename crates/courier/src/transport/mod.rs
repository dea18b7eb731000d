//! The transport abstraction.
//!
//! A [`Transport`] turns a [`UrlRequest`] into a [`TransportTask`] that
//! executes it. Tasks are created suspended; the session resumes them when
//! their request is resumed. Everything a task observes is reported through
//! its [`TaskEventSink`], which forwards the callbacks to the session's root
//! queue in the order they were made.
//!
//! [`ReqwestTransport`] is the production implementation. Tests and custom
//! stacks can provide their own.

mod reqwest;

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use tempfile::TempPath;
use tokio::sync::{mpsc, oneshot};

use crate::auth::{AuthChallenge, ChallengeDisposition};
use crate::error::{ServerTrustFailure, TransportError};
use crate::http::{HttpResponse, UrlRequest};
use crate::request::ResumeData;
use crate::session::RootMessage;

pub use self::reqwest::ReqwestTransport;

/// A request body supplied as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// Unique identifier of a transport task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric ID.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What a task should do with its request.
#[derive(Clone, Debug)]
pub enum TaskKind {
    /// Load the response body into memory.
    Data,
    /// Stream the response body to a temporary file.
    Download {
        /// Continue a previous transfer.
        resume_data: Option<ResumeData>,
    },
    /// Send an in-memory body.
    UploadData(Bytes),
    /// Send the contents of a file.
    UploadFile(PathBuf),
    /// Send a body stream obtained through [`TaskEventSink::need_new_body_stream`].
    UploadStream,
}

/// Lifecycle of a transport task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created or suspended; not transferring.
    Suspended,
    /// Transferring.
    Running,
    /// Cancel requested; completion pending.
    Canceling,
    /// Completion reported.
    Completed,
}

/// A unit of work executing one request.
pub trait TransportTask: Send + Sync + fmt::Debug {
    /// The task's ID, as given by its sink.
    fn id(&self) -> TaskId;

    /// Current lifecycle state.
    fn state(&self) -> TaskState;

    /// Start or continue the transfer.
    fn resume(&self);

    /// Pause the transfer.
    fn suspend(&self);

    /// Stop the transfer. The task still reports completion, with a
    /// cancellation error.
    fn cancel(&self);

    /// Stop a download, reporting [`ResumeData`] before completion when the
    /// transfer can be continued later.
    fn cancel_producing_resume_data(&self) {
        self.cancel();
    }
}

/// Creates tasks for requests.
pub trait Transport: Send + Sync {
    /// Create a suspended task for `request`, reporting through `sink`.
    ///
    /// The returned task's [`id`](TransportTask::id) must be `sink.task_id()`.
    fn create_task(
        &self,
        request: &UrlRequest,
        kind: TaskKind,
        sink: TaskEventSink,
    ) -> Result<Arc<dyn TransportTask>, TransportError>;
}

/// Callbacks from a task, routed to the session's root queue.
pub(crate) enum TransportEvent {
    ReceivedResponse(HttpResponse),
    ReceivedData(Bytes),
    SentBodyData {
        total_sent: u64,
        total_expected: Option<u64>,
    },
    WroteData {
        total_written: u64,
        total_expected: Option<u64>,
    },
    FinishedDownloading(TempPath),
    ProducedResumeData(ResumeData),
    Challenge {
        challenge: AuthChallenge,
        responder: oneshot::Sender<ChallengeDisposition>,
    },
    Redirect {
        response: HttpResponse,
        new_request: UrlRequest,
        responder: oneshot::Sender<Option<UrlRequest>>,
    },
    NeedNewBodyStream {
        responder: oneshot::Sender<Option<BodyStream>>,
    },
    ServerTrustFailed(ServerTrustFailure),
    Completed(Option<TransportError>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReceivedResponse(_) => "ReceivedResponse",
            Self::ReceivedData(_) => "ReceivedData",
            Self::SentBodyData { .. } => "SentBodyData",
            Self::WroteData { .. } => "WroteData",
            Self::FinishedDownloading(_) => "FinishedDownloading",
            Self::ProducedResumeData(_) => "ProducedResumeData",
            Self::Challenge { .. } => "Challenge",
            Self::Redirect { .. } => "Redirect",
            Self::NeedNewBodyStream { .. } => "NeedNewBodyStream",
            Self::ServerTrustFailed(_) => "ServerTrustFailed",
            Self::Completed(_) => "Completed",
        };
        f.write_str(name)
    }
}

/// Where a task reports what happens to it.
///
/// Calls are forwarded in order. Once the owning session is gone they are
/// dropped, and the question-style callbacks return a conservative answer.
#[derive(Clone)]
pub struct TaskEventSink {
    task: TaskId,
    root: mpsc::UnboundedSender<RootMessage>,
}

impl fmt::Debug for TaskEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEventSink").field("task", &self.task).finish()
    }
}

impl TaskEventSink {
    pub(crate) fn new(task: TaskId, root: mpsc::UnboundedSender<RootMessage>) -> Self {
        Self { task, root }
    }

    /// The task this sink reports for.
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.root
            .send(RootMessage::Transport {
                task: self.task,
                event,
            })
            .is_ok()
    }

    /// The response head arrived.
    pub fn did_receive_response(&self, response: HttpResponse) {
        self.send(TransportEvent::ReceivedResponse(response));
    }

    /// A chunk of the response body arrived.
    pub fn did_receive_data(&self, data: Bytes) {
        self.send(TransportEvent::ReceivedData(data));
    }

    /// Request body bytes were sent.
    pub fn did_send_body_data(&self, total_sent: u64, total_expected: Option<u64>) {
        self.send(TransportEvent::SentBodyData {
            total_sent,
            total_expected,
        });
    }

    /// Download bytes were written to the temporary file.
    pub fn did_write_data(&self, total_written: u64, total_expected: Option<u64>) {
        self.send(TransportEvent::WroteData {
            total_written,
            total_expected,
        });
    }

    /// The download finished into `file`. The session moves it to its
    /// destination; if nobody claims it, it is deleted.
    pub fn did_finish_downloading(&self, file: TempPath) {
        self.send(TransportEvent::FinishedDownloading(file));
    }

    /// A cancelled download can be continued from `resume_data`.
    pub fn did_produce_resume_data(&self, resume_data: ResumeData) {
        self.send(TransportEvent::ProducedResumeData(resume_data));
    }

    /// The transport rejected the server's certificate for `failure`.
    ///
    /// Report this before [`did_complete`](Self::did_complete) so the request
    /// ends with the specific trust error.
    pub fn server_trust_evaluation_failed(&self, failure: ServerTrustFailure) {
        self.send(TransportEvent::ServerTrustFailed(failure));
    }

    /// Ask how to answer an authentication challenge.
    pub async fn challenge(&self, challenge: AuthChallenge) -> ChallengeDisposition {
        let fallback = match challenge {
            AuthChallenge::ServerTrust { .. } => ChallengeDisposition::CancelAuthenticationChallenge,
            AuthChallenge::Http { .. } => ChallengeDisposition::PerformDefaultHandling,
        };
        let (responder, answer) = oneshot::channel();
        if !self.send(TransportEvent::Challenge {
            challenge,
            responder,
        }) {
            return fallback;
        }
        answer.await.unwrap_or(fallback)
    }

    /// Ask whether to follow a redirect to `new_request`.
    pub async fn will_perform_redirect(
        &self,
        response: HttpResponse,
        new_request: UrlRequest,
    ) -> Option<UrlRequest> {
        let (responder, answer) = oneshot::channel();
        if !self.send(TransportEvent::Redirect {
            response,
            new_request,
            responder,
        }) {
            return None;
        }
        answer.await.ok().flatten()
    }

    /// Ask for the body stream of a streamed upload.
    pub async fn need_new_body_stream(&self) -> Option<BodyStream> {
        let (responder, answer) = oneshot::channel();
        if !self.send(TransportEvent::NeedNewBodyStream { responder }) {
            return None;
        }
        answer.await.ok().flatten()
    }

    /// The task finished, successfully when `error` is `None`.
    ///
    /// Must be called exactly once per task.
    pub fn did_complete(&self, error: Option<TransportError>) {
        self.send(TransportEvent::Completed(error));
    }
}
