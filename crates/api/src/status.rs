use std::fmt::{self, Display};

/// Lifecycle of a consumer or producer session.
///
/// Moves forward only: `Initialized` to `Running` to `Stopped`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SessionStatus {
    /// Created but never started.
    #[default]
    Initialized,

    /// Started and serving calls.
    Running,

    /// Stopped; cannot be restarted.
    Stopped,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
