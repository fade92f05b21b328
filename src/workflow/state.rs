//! Per-workflow lifecycle state machine.

use serde::Serialize;

/// Lifecycle of one workflow loop.
///
/// Stopped → Starting → Running → Stopping → Stopped. Running re-enters
/// itself on every tick. A failed start falls back to Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkflowState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, target),
            (Stopped, Starting) |
            (Starting, Running) | (Starting, Stopped) |
            // Tick
            (Running, Running) |
            (Running, Stopping) |
            (Stopping, Stopped)
        )
    }

    /// A loop exists or is being brought up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}
