/// Errors that can occur during sandbox runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Failed to spawn a process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    /// Failed to write the file tree into the sandbox directory
    #[error("Failed to mount file tree: {0}")]
    MountFailed(String),
    /// A file tree path would escape the sandbox root
    #[error("Invalid sandbox path: {0}")]
    InvalidPath(String),
    /// Failed to signal the process
    #[error("Failed to kill process: {0}")]
    KillFailed(String),
    /// The process has already exited
    #[error("Process has exited")]
    ProcessExited,
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        RuntimeError::SpawnFailed(err.to_string())
    }
}
