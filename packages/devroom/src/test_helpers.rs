use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use sandbox_runtime::{
    ProcessOutput, RuntimeError, SandboxProcess, SandboxRuntime, ServerReady, SpawnedProcess,
};

use crate::AppState;
use crate::config::{DevroomConfig, SandboxConfig};
use crate::metrics::ServerMetrics;
use crate::relay::RoomRelay;
use crate::sandbox::{RuntimeFactory, SandboxRegistry};
use crate::store::{MemoryStore, ProjectStore};

/// Sandbox settings with a short kill timeout so tests stay fast
pub fn test_sandbox_config() -> SandboxConfig {
    SandboxConfig {
        install_command: vec!["npm".into(), "install".into()],
        start_command: vec!["npm".into(), "start".into()],
        root_dir: PathBuf::from("/nonexistent"),
        kill_timeout: Duration::from_millis(100),
        event_capacity: 256,
    }
}

/// Scripted process: exits when told to, or when signalled
pub struct FakeProcess {
    exit_tx: watch::Sender<Option<i32>>,
    output_tx: broadcast::Sender<ProcessOutput>,
    ignore_terminate: bool,
}

impl FakeProcess {
    pub fn exit(&self, code: i32) {
        self.exit_tx.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(code);
                true
            } else {
                false
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.exit_tx.borrow().is_none()
    }

    pub fn emit(&self, text: &str) {
        let _ = self.output_tx.send(ProcessOutput {
            data: text.as_bytes().to_vec(),
            timestamp: 0,
        });
    }
}

#[async_trait]
impl SandboxProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn terminate(&self) -> Result<(), RuntimeError> {
        if !self.ignore_terminate {
            self.exit(143);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<(), RuntimeError> {
        self.exit(137);
        Ok(())
    }

    async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit_tx.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|code| *code)
    }
}

/// In-memory runtime. `install` commands exit with `install_exit_code`, at
/// once unless `hold_install` is set, in which case they wait for
/// `release_installs`. Every other command runs until stopped.
pub struct FakeRuntime {
    ready_tx: broadcast::Sender<ServerReady>,
    mounts: Mutex<Vec<BTreeMap<String, String>>>,
    spawned: Mutex<Vec<(String, Arc<FakeProcess>)>>,
    held_installs: Mutex<Vec<Arc<FakeProcess>>>,
    pub install_exit_code: AtomicI32,
    pub hold_install: AtomicBool,
    pub fail_mount: AtomicBool,
    pub ignore_terminate: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            ready_tx,
            mounts: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            held_installs: Mutex::new(Vec::new()),
            install_exit_code: AtomicI32::new(0),
            hold_install: AtomicBool::new(false),
            fail_mount: AtomicBool::new(false),
            ignore_terminate: AtomicBool::new(false),
        }
    }

    pub fn mounts(&self) -> Vec<BTreeMap<String, String>> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn spawned_commands(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    /// Live non-install processes
    pub fn running_count(&self) -> usize {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.is_running())
            .count()
    }

    pub fn last_process(&self) -> Option<Arc<FakeProcess>> {
        self.spawned.lock().unwrap().last().map(|(_, p)| p.clone())
    }

    /// Let every held install finish. Installs spawned later still wait
    /// while `hold_install` is set.
    pub fn release_installs(&self) {
        let held: Vec<_> = self.held_installs.lock().unwrap().drain(..).collect();
        for process in held {
            process.emit("added 1 package\n");
            process.exit(self.install_exit_code.load(Ordering::SeqCst));
        }
    }

    pub fn held_install_count(&self) -> usize {
        self.held_installs.lock().unwrap().len()
    }

    pub fn announce_ready(&self, port: u16) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            address: format!("http://localhost:{}", port),
        });
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn mount(&self, files: &BTreeMap<String, String>) -> Result<(), RuntimeError> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(RuntimeError::MountFailed("disk full".into()));
        }
        self.mounts.lock().unwrap().push(files.clone());
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, RuntimeError> {
        let (exit_tx, _) = watch::channel(None);
        let (output_tx, output_rx) = broadcast::channel(64);
        let process = Arc::new(FakeProcess {
            exit_tx,
            output_tx,
            ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
        });

        let label = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if args.first().map(String::as_str) == Some("install") {
            if self.hold_install.load(Ordering::SeqCst) {
                self.held_installs.lock().unwrap().push(process.clone());
            } else {
                process.emit("added 1 package\n");
                process.exit(self.install_exit_code.load(Ordering::SeqCst));
            }
        }
        self.spawned.lock().unwrap().push((label, process.clone()));

        Ok(SpawnedProcess {
            process,
            output: output_rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

/// Fully wired state over a MemoryStore and one FakeRuntime shared by all workspaces
pub fn test_app_state() -> (AppState, Arc<FakeRuntime>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = DevroomConfig::new(Some(tmp.path().to_path_buf())).expect("config");
    let metrics = Arc::new(ServerMetrics::new());

    let runtime = Arc::new(FakeRuntime::new());
    let shared = runtime.clone();
    let factory: RuntimeFactory =
        Arc::new(move |_: &str| shared.clone() as Arc<dyn SandboxRuntime>);

    let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::new());
    let state = AppState {
        config: Arc::new(config),
        store,
        relay: Arc::new(RoomRelay::new(64, metrics.clone())),
        sandboxes: Arc::new(SandboxRegistry::new(
            factory,
            test_sandbox_config(),
            metrics.clone(),
        )),
        metrics,
    };

    (state, runtime, tmp)
}
