//! The bijection between in-flight requests and their live transport tasks.
//!
//! Only the session's root queue touches the map, so it needs no locking.
//! Removing an entry that does not exist means the session lost track of a
//! request or task; that is a bug in courier or in a transport, and the map
//! panics rather than continue with a desynchronised view.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, trace};

use crate::logging::targets;
use crate::request::{Request, RequestId};
use crate::transport::{TaskId, TransportTask};

#[derive(Default)]
pub(crate) struct RequestTaskMap {
    tasks_by_request: HashMap<RequestId, Arc<dyn TransportTask>>,
    requests_by_task: HashMap<TaskId, Request>,
}

impl RequestTaskMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Associate `request` with its new live `task`.
    ///
    /// A request has at most one live task; its previous task must have
    /// been removed before a new one is added.
    pub(crate) fn put(&mut self, request: Request, task: Arc<dyn TransportTask>) {
        let task_id = task.id();
        if let Some(previous) = self.tasks_by_request.get(&request.id()) {
            consistency_failure(format!(
                "{} already maps to live {}, cannot add {task_id}",
                request.id(),
                previous.id()
            ));
        }
        if self.requests_by_task.contains_key(&task_id) {
            consistency_failure(format!("{task_id} is already mapped"));
        }

        trace!(target: targets::TASK_MAP, request = %request.id(), task = %task_id, "put");
        self.tasks_by_request.insert(request.id(), task);
        self.requests_by_task.insert(task_id, request);
    }

    pub(crate) fn request(&self, task: TaskId) -> Option<&Request> {
        self.requests_by_task.get(&task)
    }

    pub(crate) fn task(&self, request: RequestId) -> Option<&Arc<dyn TransportTask>> {
        self.tasks_by_request.get(&request)
    }

    /// Remove the entry for `task`, returning its request.
    ///
    /// # Panics
    ///
    /// If `task` is not mapped.
    pub(crate) fn remove_task(&mut self, task: TaskId) -> Request {
        let Some(request) = self.requests_by_task.remove(&task) else {
            consistency_failure(format!("no request corresponding to {task} found"));
        };
        if self.tasks_by_request.remove(&request.id()).is_none() {
            consistency_failure(format!(
                "{task} maps to {} but the request has no task",
                request.id()
            ));
        }
        trace!(target: targets::TASK_MAP, request = %request.id(), task = %task, "removed by task");
        request
    }

    /// Remove the entry for `request`, returning its task.
    ///
    /// # Panics
    ///
    /// If `request` is not mapped.
    pub(crate) fn remove_request(&mut self, request: RequestId) -> Arc<dyn TransportTask> {
        let Some(task) = self.tasks_by_request.remove(&request) else {
            consistency_failure(format!("no task corresponding to {request} found"));
        };
        if self.requests_by_task.remove(&task.id()).is_none() {
            consistency_failure(format!(
                "{request} maps to {} but the task has no request",
                task.id()
            ));
        }
        trace!(target: targets::TASK_MAP, request = %request, task = %task.id(), "removed by request");
        task
    }

    pub(crate) fn len(&self) -> usize {
        let count = self.requests_by_task.len();
        assert_eq!(
            count,
            self.tasks_by_request.len(),
            "request/task map consistency error: direction counts differ"
        );
        count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn consistency_failure(message: String) -> ! {
    error!(target: targets::TASK_MAP, %message, "request/task map consistency error");
    panic!("request/task map consistency error: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpMethod, UrlRequest, UrlRequestConvertible};
    use crate::request::KindState;
    use crate::signal::Signal;
    use crate::transport::TaskState;
    use std::sync::Weak;
    use tokio::runtime::Handle;

    #[derive(Debug)]
    struct StubTask(TaskId);

    impl TransportTask for StubTask {
        fn id(&self) -> TaskId {
            self.0
        }
        fn state(&self) -> TaskState {
            TaskState::Suspended
        }
        fn resume(&self) {}
        fn suspend(&self) {}
        fn cancel(&self) {}
    }

    fn task() -> Arc<dyn TransportTask> {
        Arc::new(StubTask(TaskId::next()))
    }

    fn request() -> Request {
        let convertible: Arc<dyn UrlRequestConvertible> =
            Arc::new(UrlRequest::parse(HttpMethod::Get, "https://map.test/").unwrap());
        Request::new(
            KindState::data(),
            convertible,
            Weak::new(),
            Arc::new(Signal::new()),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_lookup_both_directions() {
        let mut map = RequestTaskMap::new();
        let (first, second) = (request(), request());
        let (t1, t2) = (task(), task());
        map.put(first.clone(), t1.clone());
        map.put(second.clone(), t2.clone());

        assert_eq!(map.len(), 2);
        assert_eq!(map.request(t1.id()), Some(&first));
        assert_eq!(map.task(second.id()).map(|t| t.id()), Some(t2.id()));

        assert_eq!(map.remove_task(t1.id()), first);
        assert!(map.task(first.id()).is_none());
        assert_eq!(map.remove_request(second.id()).id(), t2.id());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_new_task_after_removal() {
        let mut map = RequestTaskMap::new();
        let request = request();
        let (first, retry) = (task(), task());

        map.put(request.clone(), first.clone());
        map.remove_task(first.id());
        map.put(request.clone(), retry.clone());

        assert_eq!(map.task(request.id()).map(|t| t.id()), Some(retry.id()));
        assert!(map.request(first.id()).is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "consistency error")]
    async fn test_remove_unknown_task_panics() {
        let mut map = RequestTaskMap::new();
        map.remove_task(TaskId::next());
    }

    #[tokio::test]
    #[should_panic(expected = "consistency error")]
    async fn test_remove_unknown_request_panics() {
        let mut map = RequestTaskMap::new();
        map.put(request(), task());
        map.remove_request(request().id());
    }

    #[tokio::test]
    #[should_panic(expected = "already maps to live")]
    async fn test_second_live_task_panics() {
        let mut map = RequestTaskMap::new();
        let request = request();
        map.put(request.clone(), task());
        map.put(request, task());
    }
}
