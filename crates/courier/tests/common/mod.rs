//! A scriptable in-process transport.
//!
//! Every task the session creates is handed to the test through a channel,
//! together with the sink it reports to, so the test decides exactly which
//! callbacks fire and when.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use courier::http::{HttpResponse, UrlRequest};
use courier::request::ResumeData;
use courier::transport::{TaskEventSink, TaskId, TaskKind, TaskState, Transport, TransportTask};
use courier::{Session, SessionBuilder, TransportError};
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A task created by [`MockTransport`].
#[derive(Debug)]
pub struct MockTask {
    id: TaskId,
    sink: TaskEventSink,
    state: Mutex<TaskState>,
    completed: AtomicBool,
    resume_data: Mutex<Option<ResumeData>>,
    pub resumes: AtomicUsize,
    pub suspends: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockTask {
    /// Resume data reported when the task is cancelled producing resume data.
    pub fn set_resume_data(&self, resume_data: ResumeData) {
        *self.resume_data.lock() = Some(resume_data);
    }

    /// Report completion once; later calls are ignored.
    pub fn complete(&self, error: Option<TransportError>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = TaskState::Completed;
        self.sink.did_complete(error);
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl TransportTask for MockTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = TaskState::Running;
    }

    fn suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = TaskState::Suspended;
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = TaskState::Canceling;
        self.complete(Some(TransportError::cancelled()));
    }

    fn cancel_producing_resume_data(&self) {
        if let Some(resume_data) = self.resume_data.lock().take() {
            self.sink.did_produce_resume_data(resume_data);
        }
        self.cancel();
    }
}

/// What the test sees of a created task.
pub struct MockTaskHandle {
    pub request: UrlRequest,
    pub kind: TaskKind,
    pub sink: TaskEventSink,
    pub task: Arc<MockTask>,
}

impl MockTaskHandle {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn response(&self, status: u16) -> HttpResponse {
        self.response_with(status, &[])
    }

    pub fn response_with(&self, status: u16, headers: &[(&'static str, &str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, value.parse().unwrap());
        }
        HttpResponse::new(status, map, self.request.url.clone())
    }

    /// Deliver a complete response: head, body, completion.
    pub fn respond(&self, status: u16, body: &'static [u8]) {
        self.respond_with(status, &[], body);
    }

    pub fn respond_with(&self, status: u16, headers: &[(&'static str, &str)], body: &'static [u8]) {
        self.sink.did_receive_response(self.response_with(status, headers));
        if !body.is_empty() {
            self.sink.did_receive_data(Bytes::from_static(body));
        }
        self.task.complete(None);
    }

    /// Fail the task with a transport error.
    pub fn fail(&self, error: TransportError) {
        self.task.complete(Some(error));
    }
}

/// Transport whose tasks are driven by the test.
pub struct MockTransport {
    created: mpsc::UnboundedSender<MockTaskHandle>,
    fail_creation: AtomicBool,
}

impl MockTransport {
    pub fn fail_task_creation(&self) {
        self.fail_creation.store(true, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn create_task(
        &self,
        request: &UrlRequest,
        kind: TaskKind,
        sink: TaskEventSink,
    ) -> Result<Arc<dyn TransportTask>, TransportError> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                courier::TransportErrorKind::Other,
                "task creation disabled",
            ));
        }
        let task = Arc::new(MockTask {
            id: sink.task_id(),
            sink: sink.clone(),
            state: Mutex::new(TaskState::Suspended),
            completed: AtomicBool::new(false),
            resume_data: Mutex::new(None),
            resumes: AtomicUsize::new(0),
            suspends: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        });
        let _ = self.created.send(MockTaskHandle {
            request: request.clone(),
            kind,
            sink,
            task: task.clone(),
        });
        Ok(task)
    }
}

/// A session wired to a [`MockTransport`].
pub struct Harness {
    pub session: Session,
    pub transport: Arc<MockTransport>,
    created: mpsc::UnboundedReceiver<MockTaskHandle>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(configure: impl FnOnce(SessionBuilder) -> SessionBuilder) -> Self {
        let (created, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            created,
            fail_creation: AtomicBool::new(false),
        });
        let session = configure(Session::builder().transport(transport.clone()))
            .build()
            .expect("Failed to build session");
        Self {
            session,
            transport,
            created: receiver,
        }
    }

    /// The next task the session creates.
    pub async fn next_task(&mut self) -> MockTaskHandle {
        tokio::time::timeout(Duration::from_secs(30), self.created.recv())
            .await
            .expect("timed out waiting for a task")
            .expect("transport dropped")
    }

    /// Whether a task was created without waiting for one.
    pub fn try_next_task(&mut self) -> Option<MockTaskHandle> {
        self.created.try_recv().ok()
    }
}

/// Let the root queue and setup tasks drain.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
