use serde::{Deserialize, Serialize};
use std::fmt;

/// One run of the workspace program. Ids increase per controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    #[default]
    Idle,
    Mounting,
    Installing,
    Starting,
    Running,
    /// Stopped because a newer run replaced it
    Superseded,
    Killed,
}

impl SandboxState {
    /// An instance in this state owns a live process
    pub fn is_active(self) -> bool {
        matches!(self, SandboxState::Starting | SandboxState::Running)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Idle => "idle",
            SandboxState::Mounting => "mounting",
            SandboxState::Installing => "installing",
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Superseded => "superseded",
            SandboxState::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a workspace sandbox
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub instance: Option<InstanceId>,
    pub preview: Option<String>,
    /// The runtime filesystem has been bound to a tree at least once
    pub mounted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SandboxEvent {
    State(SandboxStatus),
    Output {
        instance: InstanceId,
        chunk: String,
    },
    Ready {
        instance: InstanceId,
        address: String,
    },
    Exited {
        instance: InstanceId,
        exit_code: Option<i32>,
    },
    Error {
        instance: Option<InstanceId>,
        message: String,
    },
}
