//! Tracing integration for courier.
//!
//! courier emits structured `tracing` events and never installs a
//! subscriber itself. Install one in your application to see them:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("courier::session=debug,courier::retry=debug")
//!     .init();
//! ```
//!
//! Every event carries a `request` field with the request ID where one
//! applies, so a single request can be followed across targets.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Session facade and root queue.
    pub const SESSION: &str = "courier::session";
    /// Request state transitions and finalization.
    pub const REQUEST: &str = "courier::request";
    /// Request/task bookkeeping.
    pub const TASK_MAP: &str = "courier::task_map";
    /// Retry decisions and backoff.
    pub const RETRY: &str = "courier::retry";
    /// Server trust evaluation.
    pub const TRUST: &str = "courier::trust";
    /// Transport task execution.
    pub const TRANSPORT: &str = "courier::transport";
    /// Signal emission.
    pub const SIGNAL: &str = "courier::signal";
}
