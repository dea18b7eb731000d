//! Runtime selection for sessions.
//!
//! A [`Session`](crate::Session) runs its root queue, request setup, and
//! transport tasks on a tokio runtime. Sessions built inside a runtime use
//! that runtime; sessions built from synchronous code fall back to a
//! process-wide runtime that is created on first use.

use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the fallback runtime.
///
/// Calling this is optional; the runtime is created lazily otherwise.
pub fn init() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("courier-runtime")
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime")
    })
}

/// Handle to the runtime a new session should use.
///
/// Prefers the runtime the caller is running on.
pub fn handle() -> Handle {
    Handle::try_current().unwrap_or_else(|_| init().handle().clone())
}

/// Block on a future using the fallback runtime.
///
/// Do not call this from within an async context, as it will block the
/// current thread.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    init().block_on(future)
}
