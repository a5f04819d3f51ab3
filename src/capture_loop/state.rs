use serde::Serialize;
use std::fmt;

/// Lifecycle of the capture loop.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with
/// `Running <-> Error` while the camera is being recovered and
/// `Error -> Stopped` once recovery gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl LoopState {
    /// Whether the loop task is alive (possibly recovering)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LoopState::Starting | LoopState::Running | LoopState::Error
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Stopped => "stopped",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Error => "error",
        };
        f.write_str(name)
    }
}
