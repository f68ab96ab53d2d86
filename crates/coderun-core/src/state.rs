//! Lifecycle states of a local execution.

use serde::{Deserialize, Serialize};

/// State of the local execution driver.
///
/// Each variant carries only the data valid for that state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    /// No run has been started yet.
    #[default]
    Unknown,
    /// The interpreter is being brought up.
    Loading,
    /// The interpreter initialized and is about to execute the program.
    Ready,
    /// The program is executing.
    Running,
    /// The program performed a blocking read and no buffered input remains.
    AwaitingStdin,
    /// The run failed.
    Error { message: String },
    /// The run ended, either by finishing or by being stopped.
    Stopped,
}

impl ExecutionState {
    /// Whether this state ends a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Stopped)
    }

    /// Whether the driver is between `Loading` and a terminal state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Ready | Self::Running | Self::AwaitingStdin
        )
    }

    /// Whether `next` may follow `self` in the lifecycle
    /// `Loading -> Ready -> Running -> (AwaitingStdin <-> Running)* -> (Stopped | Error)`.
    /// A stop is accepted from any state but `Stopped`.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Unknown | Self::Error { .. } | Self::Stopped, Self::Loading)
            | (Self::Loading, Self::Ready)
            | (Self::Ready | Self::AwaitingStdin, Self::Running)
            | (Self::Running, Self::AwaitingStdin) => true,
            (from, Self::Error { .. }) => from.is_active(),
            (from, Self::Stopped) => !matches!(from, Self::Stopped),
            _ => false,
        }
    }

    /// Short label for log lines.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingStdin => "awaiting_stdin",
            Self::Error { .. } => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { message } => write!(f, "error: {message}"),
            other => f.write_str(other.label()),
        }
    }
}
