use std::fmt;

/// Run state of a [`Request`](super::Request).
///
/// ```text
/// initialized -> resumed | suspended | cancelled
/// resumed     -> suspended | cancelled
/// suspended   -> resumed | cancelled
/// cancelled   -> (terminal)
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Created; neither resumed, suspended nor cancelled yet.
    #[default]
    Initialized,
    /// Running, or will run as soon as its task exists.
    Resumed,
    /// Paused.
    Suspended,
    /// Cancelled. Terminal.
    Cancelled,
}

impl RequestState {
    /// Whether a request in this state may move to `next`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;

        match (self, next) {
            (Initialized, _) => true,
            (_, Initialized) | (Cancelled, _) => false,
            (Resumed, Cancelled) | (Suspended, Cancelled) => true,
            (Resumed, Suspended) | (Suspended, Resumed) => true,
            (Resumed, Resumed) | (Suspended, Suspended) => false,
        }
    }

    /// Lowercase name, as used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Resumed => "resumed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
