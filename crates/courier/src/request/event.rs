use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use url::Url;

use crate::error::CourierError;
use crate::http::TransferProgress;
use crate::transport::TaskId;

/// Stable identity of a [`Request`](super::Request).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric ID.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Lifecycle events broadcast through [`Session::events`](crate::Session::events).
#[derive(Clone, Debug)]
pub enum RequestEvent {
    /// The request object was created.
    Created {
        /// Request identity.
        id: RequestId,
    },
    /// A URL request was built (and adapted) for an attempt.
    UrlRequestCreated {
        /// Request identity.
        id: RequestId,
        /// URL of the built request.
        url: Url,
    },
    /// A transport task was created for an attempt.
    TaskCreated {
        /// Request identity.
        id: RequestId,
        /// The new task.
        task: TaskId,
    },
    /// The request was resumed.
    Resumed {
        /// Request identity.
        id: RequestId,
    },
    /// The request was suspended.
    Suspended {
        /// Request identity.
        id: RequestId,
    },
    /// The request was cancelled.
    Cancelled {
        /// Request identity.
        id: RequestId,
    },
    /// A retry was scheduled.
    Retrying {
        /// Request identity.
        id: RequestId,
        /// 1 for the first retry.
        attempt: u32,
        /// Delay before the request is resubmitted.
        delay: Duration,
    },
    /// Request body bytes were sent.
    UploadProgress {
        /// Request identity.
        id: RequestId,
        /// Progress so far.
        progress: TransferProgress,
    },
    /// Response bytes were received.
    DownloadProgress {
        /// Request identity.
        id: RequestId,
        /// Progress so far.
        progress: TransferProgress,
    },
    /// The request finished. Emitted exactly once per request.
    Finished {
        /// Request identity.
        id: RequestId,
        /// The error it finished with, if any.
        error: Option<CourierError>,
    },
}

impl RequestEvent {
    /// The request this event is about.
    pub fn id(&self) -> RequestId {
        match self {
            Self::Created { id }
            | Self::UrlRequestCreated { id, .. }
            | Self::TaskCreated { id, .. }
            | Self::Resumed { id }
            | Self::Suspended { id }
            | Self::Cancelled { id }
            | Self::Retrying { id, .. }
            | Self::UploadProgress { id, .. }
            | Self::DownloadProgress { id, .. }
            | Self::Finished { id, .. } => *id,
        }
    }
}
