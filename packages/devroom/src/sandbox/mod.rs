//! Per-workspace sandbox controllers.
//!
//! Each workspace gets one controller actor that owns at most one live
//! instance of the workspace program. `run` replaces whatever is running:
//! the old instance is stopped and reported superseded before the new one
//! starts mounting, so two instances never overlap.

mod actor;
mod decoder;
mod registry;
mod state;

use thiserror::Error;

use sandbox_runtime::RuntimeError;

pub use actor::SandboxHandle;
pub use registry::{RuntimeFactory, SandboxRegistry};
pub use state::{InstanceId, SandboxEvent, SandboxState, SandboxStatus};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("mount failed: {0}")]
    Mount(#[source] RuntimeError),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] RuntimeError),

    #[error("install exited with status {exit_code:?}")]
    Install { exit_code: Option<i32> },

    #[error("no start command configured")]
    NoStartCommand,

    #[error("sandbox controller is gone")]
    ControllerGone,
}
