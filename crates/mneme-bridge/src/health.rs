//! Worker lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle of the worker process.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Crashed`
/// reachable from `Starting`/`Running` when the process exits on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    #[default]
    Stopped,
    /// Spawned, waiting for the ready signal or the startup grace period.
    Starting,
    /// Accepting requests.
    Running,
    /// `stop()` in progress.
    Stopping,
    /// Exited without being asked to.
    Crashed,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// A live process exists (or is being launched).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the bridge for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the current process was spawned (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Requests awaiting a response.
    pub pending: usize,
}

impl BridgeStatus {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}
