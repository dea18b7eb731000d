//! The production transport, built on a single `reqwest` client.
//!
//! Each task is a spawned future controlled through a watch channel.
//! Redirects and authentication challenges are handled here, one hop at a
//! time, so the session gets to decide on every one of them. Suspension
//! takes effect between body chunks.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, COOKIE, HeaderMap, PROXY_AUTHORIZATION};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{TaskEventSink, TaskId, TaskKind, TaskState, Transport, TransportTask};
use crate::auth::{AuthChallenge, ChallengeDisposition};
use crate::error::{CourierError, Result, TransportError, TransportErrorKind};
use crate::http::{HttpMethod, HttpResponse, UrlRequest};
use crate::logging::targets;
use crate::request::ResumeData;
use crate::runtime;
use crate::session::SessionConfiguration;
use crate::tls::{TrustFailureLog, TrustVerifier};
use crate::trust::ServerTrustManager;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// [`Transport`] backed by `reqwest` and rustls.
///
/// Certificates are checked by the session's
/// [`ServerTrustManager`](crate::trust::ServerTrustManager) during the TLS
/// handshake; hosts without a policy get standard WebPKI validation.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_redirects: usize,
    temp_dir: PathBuf,
    failures: Arc<TrustFailureLog>,
    runtime: Handle,
}

impl ReqwestTransport {
    /// Build a transport for `config`, evaluating server trust with
    /// `trust_manager` when one is given.
    pub fn new(
        config: &SessionConfiguration,
        trust_manager: Option<Arc<ServerTrustManager>>,
    ) -> Result<Self> {
        let failures = Arc::new(TrustFailureLog::default());
        let verifier = Arc::new(TrustVerifier::new(
            &config.tls,
            trust_manager,
            failures.clone(),
        )?);
        let tls = config.tls.build_rustls_config(verifier)?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(config.default_headers.clone())
            .build()
            .map_err(|err| CourierError::Transport(TransportError::from(&err)))?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
            temp_dir: config.temporary_directory.clone(),
            failures,
            runtime: runtime::handle(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn create_task(
        &self,
        request: &UrlRequest,
        kind: TaskKind,
        sink: TaskEventSink,
    ) -> std::result::Result<Arc<dyn TransportTask>, TransportError> {
        let id = sink.task_id();
        let (control, receiver) = watch::channel(Control::Suspended);
        let state = Arc::new(Mutex::new(TaskState::Suspended));

        let driver = Driver {
            client: self.client.clone(),
            request: request.clone(),
            kind,
            sink,
            control: receiver,
            max_redirects: self.max_redirects,
            temp_dir: self.temp_dir.clone(),
            failures: self.failures.clone(),
        };
        let task_state = state.clone();
        self.runtime.spawn(async move {
            let sink = driver.sink.clone();
            let outcome = driver.run().await;
            *task_state.lock() = TaskState::Completed;
            match outcome {
                Ok(()) => sink.did_complete(None),
                Err(Failure::Cancelled) => sink.did_complete(Some(TransportError::cancelled())),
                Err(Failure::Error(err)) => sink.did_complete(Some(err)),
            }
        });

        trace!(target: targets::TRANSPORT, task = %id, url = %request.url, "task created");
        Ok(Arc::new(ReqwestTask { id, control, state }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Suspended,
    Running,
    Cancelled { produce_resume_data: bool },
}

#[derive(Debug)]
struct ReqwestTask {
    id: TaskId,
    control: watch::Sender<Control>,
    state: Arc<Mutex<TaskState>>,
}

impl ReqwestTask {
    fn set_state(&self, next: TaskState) {
        let mut state = self.state.lock();
        if !matches!(*state, TaskState::Completed | TaskState::Canceling) {
            *state = next;
        }
    }

    fn request_cancel(&self, produce_resume_data: bool) {
        let changed = self.control.send_if_modified(|control| {
            if matches!(control, Control::Cancelled { .. }) {
                return false;
            }
            *control = Control::Cancelled {
                produce_resume_data,
            };
            true
        });
        if changed {
            self.set_state(TaskState::Canceling);
        }
    }
}

impl TransportTask for ReqwestTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn resume(&self) {
        let changed = self.control.send_if_modified(|control| {
            if *control == Control::Suspended {
                *control = Control::Running;
                return true;
            }
            false
        });
        if changed {
            self.set_state(TaskState::Running);
        }
    }

    fn suspend(&self) {
        let changed = self.control.send_if_modified(|control| {
            if *control == Control::Running {
                *control = Control::Suspended;
                return true;
            }
            false
        });
        if changed {
            self.set_state(TaskState::Suspended);
        }
    }

    fn cancel(&self) {
        self.request_cancel(false);
    }

    fn cancel_producing_resume_data(&self) {
        self.request_cancel(true);
    }
}

enum Failure {
    Cancelled,
    Error(TransportError),
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        Self::Error(err)
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        Self::Error(err.into())
    }
}

/// Why a wait on the control channel ended early.
#[derive(Clone, Copy, Debug)]
struct Interrupted {
    produce_resume_data: bool,
}

impl From<Interrupted> for Failure {
    fn from(_: Interrupted) -> Self {
        Self::Cancelled
    }
}

/// Wait until the task may transfer.
async fn runnable(control: &mut watch::Receiver<Control>) -> std::result::Result<(), Interrupted> {
    loop {
        match *control.borrow_and_update() {
            Control::Running => return Ok(()),
            Control::Cancelled {
                produce_resume_data,
            } => {
                return Err(Interrupted {
                    produce_resume_data,
                });
            }
            Control::Suspended => {}
        }
        // The handle is gone, so nobody can resume or observe the task.
        if control.changed().await.is_err() {
            return Err(Interrupted {
                produce_resume_data: false,
            });
        }
    }
}

async fn cancelled(mut control: watch::Receiver<Control>) -> Interrupted {
    loop {
        if let Control::Cancelled {
            produce_resume_data,
        } = *control.borrow_and_update()
        {
            return Interrupted {
                produce_resume_data,
            };
        }
        if control.changed().await.is_err() {
            return Interrupted {
                produce_resume_data: false,
            };
        }
    }
}

/// Run `future` unless the task is cancelled first.
async fn guard<F: Future>(
    control: &watch::Receiver<Control>,
    future: F,
) -> std::result::Result<F::Output, Interrupted> {
    tokio::select! {
        output = future => Ok(output),
        interrupted = cancelled(control.clone()) => Err(interrupted),
    }
}

struct Driver {
    client: reqwest::Client,
    request: UrlRequest,
    kind: TaskKind,
    sink: TaskEventSink,
    control: watch::Receiver<Control>,
    max_redirects: usize,
    temp_dir: PathBuf,
    failures: Arc<TrustFailureLog>,
}

impl Driver {
    async fn run(mut self) -> std::result::Result<(), Failure> {
        runnable(&mut self.control).await?;

        let mut request = self.request.clone();
        let mut redirects = 0usize;
        let mut auth_failures = 0u32;

        loop {
            let response = self.send(&request).await?;
            let head = HttpResponse::from_reqwest(&response);

            if head.is_redirect()
                && let Some(location) = head.header("location")
            {
                if redirects >= self.max_redirects {
                    return Err(TransportError::new(
                        TransportErrorKind::TooManyRedirects,
                        format!("stopped after {redirects} redirects"),
                    )
                    .into());
                }
                let next = redirected_request(&request, &head, location)?;
                debug!(target: targets::TRANSPORT, task = %self.sink.task_id(), status = head.status, to = %next.url, "redirect");
                let decision =
                    guard(&self.control, self.sink.will_perform_redirect(head.clone(), next)).await?;
                if let Some(next) = decision {
                    redirects += 1;
                    request = next;
                    continue;
                }
            }

            if head.status == 401
                && let Some(header) = head.header("www-authenticate")
                && let Some(host) = request.host()
            {
                let challenge =
                    AuthChallenge::from_www_authenticate(header, host, auth_failures);
                match guard(&self.control, self.sink.challenge(challenge)).await? {
                    ChallengeDisposition::UseCredential(credential) => {
                        auth_failures += 1;
                        request
                            .set_header(AUTHORIZATION.as_str(), &credential.basic_authorization())
                            .map_err(|err| TransportError::new(TransportErrorKind::Other, err.to_string()))?;
                        continue;
                    }
                    ChallengeDisposition::CancelAuthenticationChallenge => {
                        return Err(TransportError::cancelled().into());
                    }
                    ChallengeDisposition::TrustServer
                    | ChallengeDisposition::PerformDefaultHandling
                    | ChallengeDisposition::RejectProtectionSpace => {}
                }
            }

            self.sink.did_receive_response(head.clone());
            let download = match &self.kind {
                TaskKind::Download { resume_data } => Some(resume_data.clone()),
                _ => None,
            };
            return match download {
                Some(resume_data) => self.receive_download(response, &head, resume_data).await,
                None => self.receive_data(response).await,
            };
        }
    }

    async fn send(&mut self, request: &UrlRequest) -> std::result::Result<reqwest::Response, Failure> {
        let mut builder = self
            .client
            .request(request.method.to_reqwest(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match &self.kind {
            TaskKind::UploadData(data) => {
                let total = data.len() as u64;
                let chunks: Vec<io::Result<Bytes>> = chunked(data.clone()).map(Ok).collect();
                builder
                    .header(CONTENT_LENGTH, total)
                    .body(reqwest::Body::wrap_stream(with_progress(
                        futures_util::stream::iter(chunks),
                        self.sink.clone(),
                        Some(total),
                    )))
            }
            TaskKind::UploadFile(path) => {
                let file = tokio::fs::File::open(path).await?;
                let total = file.metadata().await?.len();
                builder
                    .header(CONTENT_LENGTH, total)
                    .body(reqwest::Body::wrap_stream(with_progress(
                        file_stream(file),
                        self.sink.clone(),
                        Some(total),
                    )))
            }
            TaskKind::UploadStream => {
                let stream = guard(&self.control, self.sink.need_new_body_stream())
                    .await?
                    .ok_or_else(|| {
                        TransportError::new(TransportErrorKind::Other, "no body stream available")
                    })?;
                let total = request
                    .header(CONTENT_LENGTH.as_str())
                    .and_then(|value| value.parse().ok());
                builder.body(reqwest::Body::wrap_stream(with_progress(
                    stream,
                    self.sink.clone(),
                    total,
                )))
            }
            TaskKind::Data | TaskKind::Download { .. } => match &request.body {
                Some(body) => builder.body(body.clone()),
                None => builder,
            },
        };

        match guard(&self.control, builder.send()).await? {
            Ok(response) => Ok(response),
            Err(err) => Err(self.send_error(&err, request).into()),
        }
    }

    /// Map a send failure, reporting a recorded trust failure first.
    fn send_error(&self, err: &reqwest::Error, request: &UrlRequest) -> TransportError {
        let error = TransportError::from(err);
        if error.kind == TransportErrorKind::SecureConnectionFailed
            && let Some(host) = request.host()
            && let Some(failure) = self.failures.failure_for(host)
        {
            self.sink.server_trust_evaluation_failed(failure);
        }
        warn!(target: targets::TRANSPORT, task = %self.sink.task_id(), url = %request.url, error = %error, "request failed");
        error
    }

    async fn receive_data(mut self, response: reqwest::Response) -> std::result::Result<(), Failure> {
        let mut stream = response.bytes_stream();
        loop {
            runnable(&mut self.control).await?;
            match guard(&self.control, stream.next()).await? {
                Some(Ok(chunk)) => self.sink.did_receive_data(chunk),
                Some(Err(err)) => return Err(TransportError::from(&err).into()),
                None => return Ok(()),
            }
        }
    }

    async fn receive_download(
        mut self,
        response: reqwest::Response,
        head: &HttpResponse,
        resume_data: Option<ResumeData>,
    ) -> std::result::Result<(), Failure> {
        let resumable = resume_data.filter(|resume| resume.partial_file.exists());
        if head.status == 206 && resumable.is_none() {
            return Err(TransportError::new(
                TransportErrorKind::BadServerResponse,
                "partial content without a partial file to append to",
            )
            .into());
        }
        let resuming = head.status == 206;

        let (path, mut file, mut written) = match resumable {
            Some(resume) if resuming => {
                let file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&resume.partial_file)
                    .await?;
                debug!(
                    target: targets::TRANSPORT,
                    task = %self.sink.task_id(),
                    offset = resume.bytes_received,
                    "resuming download"
                );
                (
                    TempPath::try_from_path(&resume.partial_file)?,
                    file,
                    resume.bytes_received,
                )
            }
            partial => {
                // A full body replaces the partial content. Any other status
                // leaves it for the next attempt's range request.
                if head.status == 200
                    && let Some(resume) = partial
                {
                    debug!(target: targets::TRANSPORT, task = %self.sink.task_id(), "server ignored range, discarding partial file");
                    drop(TempPath::try_from_path(&resume.partial_file)?);
                }
                let named = tempfile::Builder::new()
                    .prefix("courier-download-")
                    .tempfile_in(&self.temp_dir)?;
                let (file, path) = named.into_parts();
                (path, tokio::fs::File::from_std(file), 0)
            }
        };

        let total = head
            .content_length()
            .map(|length| if resuming { length + written } else { length });

        let mut stream = response.bytes_stream();
        loop {
            if let Err(interrupted) = runnable(&mut self.control).await {
                return self.interrupt_download(interrupted, file, path, written, head, total).await;
            }
            match guard(&self.control, stream.next()).await {
                Err(interrupted) => {
                    return self.interrupt_download(interrupted, file, path, written, head, total).await;
                }
                Ok(Some(Ok(chunk))) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    self.sink.did_write_data(written, total);
                }
                Ok(Some(Err(err))) => return Err(TransportError::from(&err).into()),
                Ok(None) => break,
            }
        }

        file.flush().await?;
        drop(file);
        self.sink.did_finish_downloading(path);
        Ok(())
    }

    /// Stop a cancelled download, keeping the partial file when resume data
    /// was asked for and the server supports ranges.
    async fn interrupt_download(
        &self,
        interrupted: Interrupted,
        mut file: tokio::fs::File,
        path: TempPath,
        written: u64,
        head: &HttpResponse,
        total: Option<u64>,
    ) -> std::result::Result<(), Failure> {
        let etag = head.header("etag").map(str::to_string);
        let last_modified = head.header("last-modified").map(str::to_string);
        let accepts_ranges = head
            .header("accept-ranges")
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));

        if !interrupted.produce_resume_data
            || written == 0
            || !(accepts_ranges || etag.is_some() || last_modified.is_some())
        {
            return Err(Failure::Cancelled);
        }

        file.flush().await?;
        drop(file);
        let partial_file = path
            .keep()
            .map_err(|err| TransportError::from(err.error))?;
        debug!(
            target: targets::TRANSPORT,
            task = %self.sink.task_id(),
            bytes = written,
            "produced resume data"
        );
        self.sink.did_produce_resume_data(ResumeData {
            url: head.url.clone(),
            bytes_received: written,
            partial_file,
            etag,
            last_modified,
            total_bytes: total,
        });
        Err(Failure::Cancelled)
    }
}

/// The request for the next hop of a redirect.
///
/// 303, and 301/302 after a POST, switch to a bodiless GET; 307 and 308
/// repeat the request as is. Credentials do not follow a change of host.
fn redirected_request(
    request: &UrlRequest,
    response: &HttpResponse,
    location: &str,
) -> std::result::Result<UrlRequest, TransportError> {
    let url = request.url.join(location).map_err(|err| {
        TransportError::new(
            TransportErrorKind::BadServerResponse,
            format!("invalid redirect location `{location}`: {err}"),
        )
    })?;

    let mut next = request.clone();
    let switch_to_get = match response.status {
        303 => request.method != HttpMethod::Head,
        301 | 302 => request.method == HttpMethod::Post,
        _ => false,
    };
    if switch_to_get {
        next.method = HttpMethod::Get;
        next.body = None;
        strip_body_headers(&mut next.headers);
    }
    if url.host_str() != request.url.host_str() || url.port_or_known_default() != request.url.port_or_known_default() {
        next.headers.remove(AUTHORIZATION);
        next.headers.remove(PROXY_AUTHORIZATION);
        next.headers.remove(COOKIE);
    }
    next.url = url;
    Ok(next)
}

fn strip_body_headers(headers: &mut HeaderMap) {
    for name in ["content-type", "content-length", "content-encoding", "transfer-encoding"] {
        headers.remove(name);
    }
}

fn chunked(data: Bytes) -> impl Iterator<Item = Bytes> {
    let len = data.len();
    (0..len)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(move |start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(len)))
}

fn file_stream(file: tokio::fs::File) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures_util::stream::try_unfold(file, |mut file| async move {
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        Ok(Some((Bytes::from(buffer), file)))
    })
}

/// Report each chunk of an upload body as it is handed to the connection.
fn with_progress<S>(
    stream: S,
    sink: TaskEventSink,
    total: Option<u64>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut sent = 0u64;
    stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
            sink.did_send_body_data(sent, total);
        }
        chunk
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: HttpMethod, url: &str) -> UrlRequest {
        UrlRequest::parse(method, url)
            .unwrap()
            .with_header("Authorization", "Basic abc")
            .unwrap()
            .with_header("Content-Type", "application/json")
            .unwrap()
            .with_body(Bytes::from_static(b"{}"))
    }

    fn response(status: u16, url: &str) -> HttpResponse {
        HttpResponse::new(status, HeaderMap::new(), url.parse().unwrap())
    }

    #[test]
    fn test_see_other_switches_to_get() {
        let original = request(HttpMethod::Put, "https://api.test/items");
        let next = redirected_request(&original, &response(303, "https://api.test/items"), "/done").unwrap();

        assert_eq!(next.method, HttpMethod::Get);
        assert!(next.body.is_none());
        assert!(next.header("content-type").is_none());
        assert_eq!(next.url.as_str(), "https://api.test/done");
        assert_eq!(next.header("authorization"), Some("Basic abc"));
    }

    #[test]
    fn test_temporary_redirect_keeps_method_and_body() {
        let original = request(HttpMethod::Post, "https://api.test/items");
        let next = redirected_request(&original, &response(307, "https://api.test/items"), "/v2/items").unwrap();

        assert_eq!(next.method, HttpMethod::Post);
        assert_eq!(next.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_cross_host_redirect_drops_credentials() {
        let original = request(HttpMethod::Get, "https://api.test/");
        let next = redirected_request(&original, &response(302, "https://api.test/"), "https://cdn.test/file").unwrap();

        assert_eq!(next.method, HttpMethod::Get);
        assert!(next.header("authorization").is_none());
        assert_eq!(next.url.host_str(), Some("cdn.test"));
    }

    #[test]
    fn test_chunked_covers_data() {
        let data = Bytes::from(vec![1u8; UPLOAD_CHUNK_SIZE * 2 + 10]);
        let chunks: Vec<Bytes> = chunked(data.clone()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 10);
        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), data.len());
        assert_eq!(chunked(Bytes::new()).count(), 0);
    }

    #[tokio::test]
    async fn test_task_control_transitions() {
        let (control, mut receiver) = watch::channel(Control::Suspended);
        let task = ReqwestTask {
            id: TaskId::next(),
            control,
            state: Arc::new(Mutex::new(TaskState::Suspended)),
        };

        task.suspend();
        assert_eq!(task.state(), TaskState::Suspended);
        task.resume();
        assert_eq!(task.state(), TaskState::Running);
        assert!(runnable(&mut receiver).await.is_ok());

        task.cancel_producing_resume_data();
        task.cancel();
        assert_eq!(task.state(), TaskState::Canceling);
        let interrupted = runnable(&mut receiver).await.unwrap_err();
        assert!(interrupted.produce_resume_data, "the first cancel wins");

        task.resume();
        assert_eq!(task.state(), TaskState::Canceling);
    }
}
