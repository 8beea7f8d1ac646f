use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::RuntimeError;
use crate::process::ProcessOutput;

/// A process inside the sandbox started listening
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub address: String,
}

/// A freshly spawned process and its output stream.
///
/// `output` is subscribed before the process produces anything, so no
/// leading chunk is lost.
pub struct SpawnedProcess {
    pub process: Arc<dyn SandboxProcess>,
    pub output: broadcast::Receiver<ProcessOutput>,
}

/// Control surface of one running sandbox process
#[async_trait]
pub trait SandboxProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to stop (SIGTERM)
    async fn terminate(&self) -> Result<(), RuntimeError>;

    /// Stop the process unconditionally (SIGKILL)
    async fn kill(&self) -> Result<(), RuntimeError>;

    /// Wait for exit. `None` when the exit status could not be observed.
    async fn wait(&self) -> Option<i32>;
}

/// The process-spawning collaborator behind a sandbox controller
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Bind the sandbox filesystem to a snapshot of `path -> contents`
    async fn mount(&self, files: &BTreeMap<String, String>) -> Result<(), RuntimeError>;

    /// Start `command args...` inside the mounted filesystem
    async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, RuntimeError>;

    /// Notifications for servers that began accepting connections
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}
