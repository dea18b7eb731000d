//! The root queue.
//!
//! One task per session owns the request/task map and the set of active
//! requests, and handles every [`RootMessage`] in arrival order. Building
//! and adapting URL requests, validating responses, asking the retrier and
//! waiting out retry delays happen in spawned tasks that post their outcome
//! back here, so slow validation or a long backoff never holds up other
//! requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tracing::{debug, error, trace, warn};

use super::{RootMessage, SessionContext, StateChange};
use crate::auth::{AuthChallenge, ChallengeDisposition};
use crate::error::{CourierError, Result};
use crate::http::UrlRequest;
use crate::interceptor::{AdaptState, RequestAdapter, RequestRetrier, RetryResult};
use crate::logging::targets;
use crate::request::{Request, RequestEvent, RequestId, RequestState};
use crate::task_map::RequestTaskMap;
use crate::transport::{TaskEventSink, TaskId, TaskKind, TransportEvent};
use crate::trust::TrustDecision;

pub(crate) struct SessionDelegate {
    context: Arc<SessionContext>,
    root: WeakUnboundedSender<RootMessage>,
    task_map: RequestTaskMap,
    active: HashMap<RequestId, Request>,
}

impl SessionDelegate {
    pub(crate) fn new(context: Arc<SessionContext>, root: WeakUnboundedSender<RootMessage>) -> Self {
        Self {
            context,
            root,
            task_map: RequestTaskMap::new(),
            active: HashMap::new(),
        }
    }

    /// Handle messages until every sender is gone.
    pub(crate) async fn run(mut self, mut receiver: UnboundedReceiver<RootMessage>) {
        while let Some(message) = receiver.recv().await {
            self.handle(message);
        }
        debug!(target: targets::SESSION, "root queue stopped");
    }

    fn handle(&mut self, message: RootMessage) {
        match message {
            RootMessage::Perform(request) => self.perform(request),
            RootMessage::UrlRequestReady { request, result } => self.url_request_ready(request, result),
            RootMessage::StateChanged { request, change } => self.state_changed(&request, change),
            RootMessage::Transport { task, event } => self.transport_event(task, event),
            RootMessage::RetryDecided { request, result } => self.retry_decided(request, result),
            RootMessage::Resubmit(request) => self.resubmit(request),
            RootMessage::CancelAll => {
                for request in self.active.values() {
                    request.cancel();
                }
            }
            RootMessage::SessionDropped => self.session_dropped(),
        }
    }

    fn perform(&mut self, request: Request) {
        self.active.insert(request.id(), request.clone());
        if request.is_finished() {
            self.finish(&request);
            return;
        }
        self.setup(request.clone());
        // A caller who already resumed or suspended the request decides.
        if self.context.configuration.start_requests_immediately && request.is_initialized() {
            request.resume();
        }
    }

    /// Build and adapt the next attempt's URL request off the root queue.
    fn setup(&self, request: Request) {
        let context = self.context.clone();
        let root = self.root.clone();
        self.context.runtime.spawn(async move {
            let result = prepare(&context, &request).await;
            if let Some(root) = root.upgrade() {
                let _ = root.send(RootMessage::UrlRequestReady { request, result });
            }
        });
    }

    fn url_request_ready(&mut self, request: Request, result: Result<(UrlRequest, TaskKind)>) {
        if request.is_finished() {
            trace!(target: targets::SESSION, request = %request.id(), "setup finished after request");
            return;
        }

        let (url_request, kind) = match result {
            Ok(ready) => ready,
            Err(err) => {
                debug!(target: targets::SESSION, request = %request.id(), error = %err, "request setup failed");
                request.record_error(err);
                self.retry_or_finish(request);
                return;
            }
        };

        request.did_create_url_request(url_request.clone());
        if request.is_cancelled() {
            self.finish(&request);
            return;
        }

        let Some(root) = self.root.upgrade() else {
            return;
        };
        let task_id = TaskId::next();
        let sink = TaskEventSink::new(task_id, root);
        let task = match self.context.transport.create_task(&url_request, kind, sink) {
            Ok(task) => task,
            Err(err) => {
                warn!(target: targets::SESSION, request = %request.id(), error = %err, "task creation failed");
                request.record_error(CourierError::TaskCreationFailed(err.to_string()));
                self.finish(&request);
                return;
            }
        };
        if task.id() != task_id {
            error!(target: targets::SESSION, expected = %task_id, actual = %task.id(), "transport returned a task with a foreign id");
            panic!("transport returned {} for a task created as {task_id}", task.id());
        }

        self.task_map.put(request.clone(), task.clone());
        request.did_create_task(task_id);

        match request.state() {
            RequestState::Resumed => task.resume(),
            RequestState::Suspended => task.suspend(),
            RequestState::Initialized | RequestState::Cancelled => {}
        }
    }

    fn state_changed(&mut self, request: &Request, change: StateChange) {
        if request.is_finished() {
            return;
        }
        let task = self.task_map.task(request.id()).cloned();
        match (change, task) {
            (StateChange::Resume, Some(task)) => task.resume(),
            (StateChange::Suspend, Some(task)) => task.suspend(),
            (StateChange::Cancel { produce_resume_data }, Some(task)) => {
                if produce_resume_data {
                    task.cancel_producing_resume_data();
                } else {
                    task.cancel();
                }
            }
            // Setup or a retry delay is in flight; the task will pick up the
            // state when it is created.
            (StateChange::Resume | StateChange::Suspend, None) => {}
            (StateChange::Cancel { .. }, None) => self.finish(request),
        }
    }

    fn transport_event(&mut self, task: TaskId, event: TransportEvent) {
        if let TransportEvent::Completed(error) = event {
            self.task_completed(task, error.map(CourierError::Transport));
            return;
        }

        let Some(request) = self.task_map.request(task).cloned() else {
            trace!(target: targets::SESSION, task = %task, ?event, "event for unknown task dropped");
            return;
        };

        match event {
            TransportEvent::ReceivedResponse(response) => request.did_receive_response(response),
            TransportEvent::ReceivedData(data) => request.did_receive_data(data),
            TransportEvent::SentBodyData {
                total_sent,
                total_expected,
            } => request.did_send_body_data(total_sent, total_expected),
            TransportEvent::WroteData {
                total_written,
                total_expected,
            } => request.did_write_data(total_written, total_expected),
            TransportEvent::FinishedDownloading(file) => request.did_finish_downloading(file),
            TransportEvent::ProducedResumeData(resume_data) => {
                request.did_produce_resume_data(resume_data)
            }
            TransportEvent::Challenge {
                challenge,
                responder,
            } => {
                let disposition = self.challenge(&request, challenge);
                let _ = responder.send(disposition);
            }
            TransportEvent::Redirect {
                response,
                new_request,
                responder,
            } => {
                let handler = request
                    .redirect_handler()
                    .or_else(|| self.context.redirect_handler.clone());
                let decision = match handler {
                    Some(handler) => {
                        let task_request = request.request().unwrap_or_else(|| new_request.clone());
                        handler.redirect(&task_request, new_request, &response)
                    }
                    None => Some(new_request),
                };
                debug!(
                    target: targets::SESSION,
                    request = %request.id(),
                    task = %task,
                    follow = decision.is_some(),
                    "redirect"
                );
                let _ = responder.send(decision);
            }
            TransportEvent::NeedNewBodyStream { responder } => {
                if !request.is_stream_upload() {
                    error!(target: targets::SESSION, request = %request.id(), task = %task, "body stream requested for a request without one");
                    panic!("{task} asked for a body stream but {} is not a stream upload", request.id());
                }
                let _ = responder.send(request.take_upload_stream());
            }
            TransportEvent::ServerTrustFailed(failure) => {
                request.record_error(CourierError::ServerTrustEvaluationFailed(failure));
            }
            TransportEvent::Completed(_) => unreachable!("handled above"),
        }
    }

    fn challenge(&self, request: &Request, challenge: AuthChallenge) -> ChallengeDisposition {
        match challenge {
            AuthChallenge::ServerTrust { host, trust } => {
                let Some(manager) = &self.context.trust_manager else {
                    return ChallengeDisposition::PerformDefaultHandling;
                };
                let trust = trust.or_roots(&self.context.trust_roots);
                match manager.evaluate(&trust, &host) {
                    TrustDecision::Trusted => ChallengeDisposition::TrustServer,
                    TrustDecision::PerformDefaultHandling => ChallengeDisposition::PerformDefaultHandling,
                    TrustDecision::Rejected(failure) => {
                        // Recorded now so it survives the generic error the
                        // transport completes with.
                        request.record_error(CourierError::ServerTrustEvaluationFailed(failure));
                        ChallengeDisposition::CancelAuthenticationChallenge
                    }
                }
            }
            AuthChallenge::Http {
                host,
                previous_failure_count,
                ..
            } => {
                if previous_failure_count > 0 {
                    debug!(target: targets::SESSION, request = %request.id(), %host, "credential rejected, not retrying challenge");
                    return ChallengeDisposition::RejectProtectionSpace;
                }
                request
                    .credential()
                    .or_else(|| self.context.credentials.credential_for(&host).cloned())
                    .map_or(
                        ChallengeDisposition::PerformDefaultHandling,
                        ChallengeDisposition::UseCredential,
                    )
            }
        }
    }

    fn task_completed(&mut self, task: TaskId, error: Option<CourierError>) {
        let request = self.task_map.remove_task(task);
        if request.is_finished() {
            return;
        }
        debug!(
            target: targets::SESSION,
            request = %request.id(),
            task = %task,
            error = error.as_ref().map(tracing::field::display),
            "task completed"
        );
        if let Some(error) = error {
            request.record_error(error);
        }
        self.retry_or_finish(request);
    }

    /// Validate the attempt and ask the retrier about a failure, off the
    /// root queue. The outcome comes back as [`RootMessage::RetryDecided`].
    fn retry_or_finish(&self, request: Request) {
        let context = self.context.clone();
        let root = self.root.clone();
        self.context.runtime.spawn(async move {
            request.run_validators();
            let result = match request.error() {
                Some(error) if !request.is_cancelled() && !error.is_explicitly_cancelled() => {
                    context.interceptor.retry(&request, &error).await
                }
                _ => RetryResult::DoNotRetry,
            };
            if let Some(root) = root.upgrade() {
                let _ = root.send(RootMessage::RetryDecided { request, result });
            }
        });
    }

    fn retry_decided(&mut self, request: Request, result: RetryResult) {
        if request.is_finished() {
            return;
        }
        let delay = match result {
            RetryResult::DoNotRetry => {
                self.finish(&request);
                return;
            }
            RetryResult::DoNotRetryWithError(retry_error) => {
                let error = match request.error() {
                    Some(original) => CourierError::RequestRetryFailed {
                        retry_error: Box::new(retry_error),
                        original: Box::new(original),
                    },
                    None => retry_error,
                };
                request.record_error(error);
                self.finish(&request);
                return;
            }
            RetryResult::Retry => Duration::ZERO,
            RetryResult::RetryWithDelay(delay) => delay,
        };
        if request.is_cancelled() {
            self.finish(&request);
            return;
        }

        let attempt = request.retry_count() + 1;
        debug!(
            target: targets::RETRY,
            request = %request.id(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying"
        );
        self.context.events.emit(RequestEvent::Retrying {
            id: request.id(),
            attempt,
            delay,
        });

        let root = self.root.clone();
        self.context.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(root) = root.upgrade() {
                let _ = root.send(RootMessage::Resubmit(request));
            }
        });
    }

    fn resubmit(&mut self, request: Request) {
        if request.is_finished() {
            return;
        }
        if request.is_cancelled() {
            self.finish(&request);
            return;
        }
        request.prepare_for_retry();
        self.setup(request);
    }

    fn session_dropped(&mut self) {
        debug!(target: targets::SESSION, active = self.active.len(), "session dropped");
        for (id, request) in self.active.drain() {
            request.record_error(CourierError::SessionDeinitialized);
            if let Some(task) = self.task_map.task(id) {
                task.cancel();
            }
            request.finish();
        }
    }

    fn finish(&mut self, request: &Request) {
        self.active.remove(&request.id());
        request.finish();
    }
}

/// Build the URL request for the next attempt and run it through the
/// session's adapters.
async fn prepare(context: &SessionContext, request: &Request) -> Result<(UrlRequest, TaskKind)> {
    let threshold = context.configuration.multipart_memory_threshold;
    let temp_dir = context.configuration.temporary_directory.clone();
    let building = request.clone();
    let (url_request, kind) =
        tokio::task::spawn_blocking(move || building.build_task_request(threshold, &temp_dir))
            .await
            .map_err(|err| CourierError::TaskCreationFailed(format!("request setup panicked: {err}")))??;

    let state = AdaptState {
        request_id: request.id(),
        retry_count: request.retry_count(),
    };
    let adapted = context
        .interceptor
        .adapt(url_request, &state)
        .await
        .map_err(|err| CourierError::RequestAdaptationFailed(Box::new(err)))?;
    Ok((adapted, kind))
}
