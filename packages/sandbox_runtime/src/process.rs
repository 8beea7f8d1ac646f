use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::RuntimeError;
use crate::runtime::SandboxProcess;

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 120,
    pixel_width: 0,
    pixel_height: 0,
};

/// Configuration for spawning a sandbox process
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Output chunk from a sandbox process (stdout and stderr share the PTY)
#[derive(Clone, Debug)]
pub struct ProcessOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

/// How hard to stop the process group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignalKind {
    Term,
    Kill,
}

/// Messages that can be sent to the process actor
pub(crate) enum ProcessMessage {
    Signal {
        kind: SignalKind,
        respond_to: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

/// Handle to communicate with a process actor
#[derive(Clone)]
pub struct ProcessHandle {
    sender: mpsc::Sender<ProcessMessage>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
}

impl ProcessHandle {
    async fn signal(&self, kind: SignalKind) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessMessage::Signal {
                kind,
                respond_to: tx,
            })
            .await
            .map_err(|_| RuntimeError::ProcessExited)?;
        rx.await.map_err(|_| RuntimeError::ProcessExited)?
    }
}

#[async_trait]
impl SandboxProcess for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self) -> Result<(), RuntimeError> {
        self.signal(SignalKind::Term).await
    }

    async fn kill(&self) -> Result<(), RuntimeError> {
        self.signal(SignalKind::Kill).await
    }

    async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = rx.wait_for(Option::is_some).await.map(|code| *code);
        code.unwrap_or(None)
    }
}

/// The process actor that owns a single PTY-backed child
pub struct ProcessActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    command: String,
    pid: Option<u32>,
    receiver: mpsc::Receiver<ProcessMessage>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl ProcessActor {
    /// Spawn a new process and return a handle to it, plus an output receiver
    /// that is subscribed before the first byte is read.
    pub fn spawn(
        config: ProcessConfig,
    ) -> Result<(ProcessHandle, broadcast::Receiver<ProcessOutput>), RuntimeError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PTY_SIZE)
            .context("Failed to open PTY")
            .map_err(RuntimeError::from)?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir.display());
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        // Dev servers skip interactive prompts and keep plain URLs in their banners
        cmd.env("CI", "true");

        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }

        info!(
            "Spawning sandbox command: {} with args: {:?}",
            config.command, config.args
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            RuntimeError::SpawnFailed(e.to_string())
        })?;

        let pid = child.process_id();
        debug!("Sandbox process started with PID: {:?}", pid);

        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut actor = Self {
            master: pair.master,
            writer: None,
            child,
            command: config.command,
            pid,
            receiver: msg_rx,
            exit_tx,
        };

        let mut reader = actor
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(RuntimeError::from)?;

        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF detected - process has exited");
                        break;
                    }
                    Ok(n) => {
                        let output = ProcessOutput {
                            data: buffer[..n].to_vec(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let _ = output_tx.send(output);
                    }
                    Err(e) => {
                        // EIO is how Linux reports a closed PTY
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok((
            ProcessHandle {
                sender: msg_tx,
                exit_rx,
                pid,
            },
            output_rx,
        ))
    }

    async fn run(&mut self) {
        debug!(
            "Process actor started for command: {} with PID: {:?}",
            self.command, self.pid
        );

        // Hold the writer so stdin stays open; some dev servers exit on stdin EOF
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => warn!("Failed to get PTY writer: {}", e),
        }

        let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);

        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(ProcessMessage::Signal { kind, respond_to }) => {
                        let _ = respond_to.send(self.handle_signal(kind));
                    }
                    None => {
                        // Every handle is gone; nobody can stop this child later
                        debug!("All handles dropped, killing PID {:?}", self.pid);
                        let _ = self.child.kill();
                        break;
                    }
                },
                _ = poll.tick() => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        let code = status.exit_code() as i32;
                        info!("Sandbox process {:?} exited with code {}", self.pid, code);
                        let _ = self.exit_tx.send(Some(code));
                        break;
                    }
                }
            }
        }

        debug!("Process actor shutting down");
    }

    fn handle_signal(&mut self, kind: SignalKind) -> Result<(), RuntimeError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                // The PTY child leads its own process group; take npm's children with it
                let pid = Pid::from_raw(pid as i32);
                match kind {
                    SignalKind::Term => {
                        if killpg(pid, Signal::SIGTERM).is_err() {
                            kill(pid, Signal::SIGTERM)
                                .map_err(|e| RuntimeError::KillFailed(e.to_string()))?;
                        }
                        return Ok(());
                    }
                    SignalKind::Kill => {
                        let _ = killpg(pid, Signal::SIGKILL);
                    }
                }
            }
        }

        debug!("Killing sandbox process {:?} ({:?})", self.pid, kind);
        self.child
            .kill()
            .map_err(|e| RuntimeError::KillFailed(e.to_string()))
    }
}
