use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use sandbox_runtime::{
    ProcessOutput, SandboxProcess, SandboxRuntime, ServerReady, SpawnedProcess,
};

use crate::config::SandboxConfig;
use crate::file_tree::FileTree;
use crate::metrics::ServerMetrics;

use super::SandboxError;
use super::decoder::Utf8StreamDecoder;
use super::state::{InstanceId, SandboxEvent, SandboxState, SandboxStatus};

/// Commands processed one at a time by the controller actor
pub(crate) enum SandboxCommand {
    Mount {
        tree: FileTree,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
    },
    Run {
        tree: FileTree,
        respond_to: oneshot::Sender<Result<InstanceId, SandboxError>>,
    },
    Kill {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a workspace's sandbox controller. Cheap to clone; every session
/// of the workspace holds one.
#[derive(Clone)]
pub struct SandboxHandle {
    workspace_id: String,
    sender: mpsc::Sender<SandboxCommand>,
    status: watch::Receiver<SandboxStatus>,
    events: broadcast::Sender<SandboxEvent>,
}

impl SandboxHandle {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Current status without waiting behind queued commands
    pub fn status(&self) -> SandboxStatus {
        self.status.borrow().clone()
    }

    /// Live events from now on; nothing is replayed
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    /// Bind the sandbox filesystem to `tree` without touching the run state
    pub async fn mount(&self, tree: FileTree) -> Result<(), SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::Mount {
                tree,
                respond_to: tx,
            })
            .await
            .map_err(|_| SandboxError::ControllerGone)?;
        rx.await.map_err(|_| SandboxError::ControllerGone)?
    }

    /// Replace any running instance with a fresh mount/install/start of `tree`
    pub async fn run(&self, tree: FileTree) -> Result<InstanceId, SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::Run {
                tree,
                respond_to: tx,
            })
            .await
            .map_err(|_| SandboxError::ControllerGone)?;
        rx.await.map_err(|_| SandboxError::ControllerGone)?
    }

    /// Stop the active instance, if any
    pub async fn kill(&self) -> Result<(), SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::Kill { respond_to: tx })
            .await
            .map_err(|_| SandboxError::ControllerGone)?;
        rx.await.map_err(|_| SandboxError::ControllerGone)
    }
}

struct ActiveInstance {
    id: InstanceId,
    process: Arc<dyn SandboxProcess>,
}

/// Owns the single live instance of one workspace
pub struct SandboxActor {
    workspace_id: String,
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    metrics: Arc<ServerMetrics>,
    receiver: mpsc::Receiver<SandboxCommand>,
    status_tx: watch::Sender<SandboxStatus>,
    events_tx: broadcast::Sender<SandboxEvent>,
    exit_tx: mpsc::Sender<(InstanceId, Option<i32>)>,
    exit_rx: mpsc::Receiver<(InstanceId, Option<i32>)>,
    ready_rx: broadcast::Receiver<ServerReady>,
    ready_open: bool,
    active: Option<ActiveInstance>,
    next_instance: u64,
}

impl SandboxActor {
    pub fn spawn(
        workspace_id: &str,
        runtime: Arc<dyn SandboxRuntime>,
        config: SandboxConfig,
        metrics: Arc<ServerMetrics>,
    ) -> SandboxHandle {
        let (sender, receiver) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(SandboxStatus::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (exit_tx, exit_rx) = mpsc::channel(8);
        let ready_rx = runtime.server_ready();

        let handle = SandboxHandle {
            workspace_id: workspace_id.to_string(),
            sender,
            status: status_rx,
            events: events_tx.clone(),
        };

        let actor = SandboxActor {
            workspace_id: workspace_id.to_string(),
            runtime,
            config,
            metrics,
            receiver,
            status_tx,
            events_tx,
            exit_tx,
            exit_rx,
            ready_rx,
            ready_open: true,
            active: None,
            next_instance: 1,
        };
        tokio::spawn(actor.run());

        handle
    }

    async fn run(mut self) {
        debug!("Sandbox controller for {} started", self.workspace_id);

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((instance, exit_code)) = self.exit_rx.recv() => {
                    self.handle_exit(instance, exit_code);
                }
                ready = self.ready_rx.recv(), if self.ready_open => match ready {
                    Ok(ready) => self.handle_ready(ready),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Sandbox {} missed {} ready notifications", self.workspace_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => self.ready_open = false,
                },
            }
        }

        if let Some(active) = self.active.take() {
            self.stop_instance(&active).await;
        }
        debug!("Sandbox controller for {} stopped", self.workspace_id);
    }

    async fn handle_command(&mut self, command: SandboxCommand) {
        match command {
            SandboxCommand::Mount { tree, respond_to } => {
                let result = self.handle_mount(&tree).await;
                let _ = respond_to.send(result);
            }
            SandboxCommand::Run { tree, respond_to } => {
                let result = self.handle_run(&tree).await;
                let _ = respond_to.send(result);
            }
            SandboxCommand::Kill { respond_to } => {
                self.handle_kill().await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_mount(&mut self, tree: &FileTree) -> Result<(), SandboxError> {
        match self.runtime.mount(&tree.to_mount_map()).await {
            Ok(()) => {
                self.status_tx.send_modify(|s| s.mounted = true);
                debug!("Remounted sandbox {} ({} files)", self.workspace_id, tree.len());
                Ok(())
            }
            Err(e) => {
                warn!("Mount failed for sandbox {}: {}", self.workspace_id, e);
                let err = SandboxError::Mount(e);
                self.emit(SandboxEvent::Error {
                    instance: None,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn handle_run(&mut self, tree: &FileTree) -> Result<InstanceId, SandboxError> {
        // The previous instance is fully gone before the new one exists
        if let Some(previous) = self.active.take() {
            info!(
                "Superseding instance {} of sandbox {}",
                previous.id, self.workspace_id
            );
            self.stop_instance(&previous).await;
            self.metrics.sandbox_superseded();
            self.set_state(Some(previous.id), SandboxState::Superseded);
        }

        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        self.metrics.sandbox_run_started();

        self.set_state(Some(id), SandboxState::Mounting);
        if let Err(e) = self.runtime.mount(&tree.to_mount_map()).await {
            return Err(self.fail(id, SandboxError::Mount(e)));
        }
        self.status_tx.send_modify(|s| s.mounted = true);

        let install_command = self.config.install_command.clone();
        let start_command = self.config.start_command.clone();

        if let Some((program, args)) = install_command.split_first() {
            self.set_state(Some(id), SandboxState::Installing);
            let install = match self.runtime.spawn(program, args).await {
                Ok(spawned) => spawned,
                Err(e) => return Err(self.fail(id, SandboxError::Spawn(e))),
            };
            let SpawnedProcess { process, output } = install;
            self.forward_output(id, output);

            let exit_code = process.wait().await;
            if exit_code != Some(0) {
                return Err(self.fail(id, SandboxError::Install { exit_code }));
            }
        }

        let Some((program, args)) = start_command.split_first() else {
            return Err(self.fail(id, SandboxError::NoStartCommand));
        };

        self.set_state(Some(id), SandboxState::Starting);
        // Fresh subscription: notifications from earlier instances are discarded
        self.ready_rx = self.runtime.server_ready();
        self.ready_open = true;

        let started = match self.runtime.spawn(program, args).await {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail(id, SandboxError::Spawn(e))),
        };
        let SpawnedProcess { process, output } = started;
        self.forward_output(id, output);
        self.watch_exit(id, process.clone());

        info!(
            "Sandbox {} started instance {} (pid {:?})",
            self.workspace_id,
            id,
            process.pid()
        );
        self.active = Some(ActiveInstance { id, process });
        Ok(id)
    }

    async fn handle_kill(&mut self) {
        let Some(active) = self.active.take() else {
            debug!("Kill for idle sandbox {} ignored", self.workspace_id);
            return;
        };

        info!("Killing instance {} of sandbox {}", active.id, self.workspace_id);
        self.stop_instance(&active).await;
        self.set_state(Some(active.id), SandboxState::Killed);
    }

    fn handle_ready(&mut self, ready: ServerReady) {
        let Some(active) = &self.active else {
            debug!("Ignoring ready notification for idle sandbox {}", self.workspace_id);
            return;
        };
        let id = active.id;

        info!(
            "Sandbox {} instance {} ready at {}",
            self.workspace_id, id, ready.address
        );
        self.status_tx.send_modify(|s| {
            s.state = SandboxState::Running;
            s.preview = Some(ready.address.clone());
        });
        self.emit(SandboxEvent::Ready {
            instance: id,
            address: ready.address,
        });
        self.emit(SandboxEvent::State(self.status_tx.borrow().clone()));
    }

    fn handle_exit(&mut self, instance: InstanceId, exit_code: Option<i32>) {
        match &self.active {
            Some(active) if active.id == instance => {}
            _ => {
                debug!("Ignoring exit of stale instance {}", instance);
                return;
            }
        }

        info!(
            "Instance {} of sandbox {} exited with {:?}",
            instance, self.workspace_id, exit_code
        );
        self.active = None;
        self.emit(SandboxEvent::Exited {
            instance,
            exit_code,
        });
        self.set_state(None, SandboxState::Idle);
    }

    /// Terminate, wait up to the kill timeout, then force
    async fn stop_instance(&self, instance: &ActiveInstance) {
        if let Err(e) = instance.process.terminate().await {
            warn!("Failed to terminate instance {}: {}", instance.id, e);
        }

        if tokio::time::timeout(self.config.kill_timeout, instance.process.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            "Instance {} ignored termination for {:?}, killing",
            instance.id, self.config.kill_timeout
        );
        if let Err(e) = instance.process.kill().await {
            warn!("Failed to kill instance {}: {}", instance.id, e);
        }
        if tokio::time::timeout(self.config.kill_timeout, instance.process.wait())
            .await
            .is_err()
        {
            error!("Instance {} did not exit after SIGKILL", instance.id);
        }
    }

    fn fail(&mut self, instance: InstanceId, err: SandboxError) -> SandboxError {
        warn!(
            "Run {} of sandbox {} failed: {}",
            instance, self.workspace_id, err
        );
        self.metrics.sandbox_run_failed();
        self.emit(SandboxEvent::Error {
            instance: Some(instance),
            message: err.to_string(),
        });
        self.set_state(None, SandboxState::Idle);
        err
    }

    fn set_state(&mut self, instance: Option<InstanceId>, state: SandboxState) {
        self.status_tx.send_modify(|s| {
            s.state = state;
            s.instance = instance;
            if !state.is_active() {
                s.preview = None;
            }
        });
        debug!("Sandbox {} -> {}", self.workspace_id, state);
        self.emit(SandboxEvent::State(self.status_tx.borrow().clone()));
    }

    fn emit(&self, event: SandboxEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn forward_output(&self, instance: InstanceId, mut output: broadcast::Receiver<ProcessOutput>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut decoder = Utf8StreamDecoder::new();
            loop {
                match output.recv().await {
                    Ok(chunk) => {
                        let text = decoder.decode(&chunk.data);
                        if !text.is_empty() {
                            let _ = events.send(SandboxEvent::Output {
                                instance,
                                chunk: text,
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Output of instance {} lagged by {} chunks", instance, n);
                        decoder.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn watch_exit(&self, instance: InstanceId, process: Arc<dyn SandboxProcess>) {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let exit_code = process.wait().await;
            let _ = exit_tx.send((instance, exit_code)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeRuntime, test_sandbox_config};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn spawn_controller(runtime: Arc<FakeRuntime>) -> SandboxHandle {
        SandboxActor::spawn(
            "w1",
            runtime,
            test_sandbox_config(),
            Arc::new(ServerMetrics::new()),
        )
    }

    fn tree() -> FileTree {
        [("package.json", "{}"), ("index.js", "console.log(1)")]
            .into_iter()
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<SandboxEvent>) -> Vec<SandboxEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SandboxEvent]) -> Vec<(Option<InstanceId>, SandboxState)> {
        events
            .iter()
            .filter_map(|e| match e {
                SandboxEvent::State(s) => Some((s.instance, s.state)),
                _ => None,
            })
            .collect()
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SandboxEvent>, mut pred: F) -> SandboxEvent
    where
        F: FnMut(&SandboxEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event in time")
    }

    #[tokio::test]
    async fn run_walks_mount_install_start() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let id = handle.run(tree()).await.unwrap();

        assert_eq!(
            states(&drain(&mut events)),
            vec![
                (Some(id), SandboxState::Mounting),
                (Some(id), SandboxState::Installing),
                (Some(id), SandboxState::Starting),
            ]
        );
        assert_eq!(runtime.mounts().len(), 1);
        assert_eq!(runtime.spawned_commands(), vec!["npm install", "npm start"]);
        assert_eq!(handle.status().state, SandboxState::Starting);
        assert!(handle.status().mounted);
    }

    #[tokio::test]
    async fn second_run_supersedes_first_before_starting() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let first = handle.run(tree()).await.unwrap();
        let second = handle.run(tree()).await.unwrap();
        assert_ne!(first, second);

        let seen = states(&drain(&mut events));
        let superseded = seen
            .iter()
            .position(|s| *s == (Some(first), SandboxState::Superseded))
            .expect("first superseded");
        let second_mounting = seen
            .iter()
            .position(|s| *s == (Some(second), SandboxState::Mounting))
            .expect("second mounting");
        let second_starting = seen
            .iter()
            .position(|s| *s == (Some(second), SandboxState::Starting))
            .expect("second starting");
        assert!(superseded < second_mounting);
        assert!(second_mounting < second_starting);

        assert_eq!(runtime.running_count(), 1);
        assert_eq!(handle.status().instance, Some(second));
    }

    #[tokio::test]
    async fn concurrent_runs_leave_one_live_instance() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());

        let (a, b, c) = tokio::join!(
            handle.run(tree()),
            handle.run(tree()),
            handle.run(tree())
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.ignore_terminate.store(true, Ordering::SeqCst);
        let handle = spawn_controller(runtime.clone());

        handle.run(tree()).await.unwrap();
        handle.run(tree()).await.unwrap();

        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn ready_publishes_preview() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let id = handle.run(tree()).await.unwrap();
        runtime.announce_ready(3000);

        let event = wait_for(&mut events, |e| matches!(e, SandboxEvent::Ready { .. })).await;
        assert_eq!(
            event,
            SandboxEvent::Ready {
                instance: id,
                address: "http://localhost:3000".into()
            }
        );

        let status = handle.status();
        assert_eq!(status.state, SandboxState::Running);
        assert_eq!(status.preview.as_deref(), Some("http://localhost:3000"));
    }

    #[tokio::test]
    async fn later_ready_replaces_address() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        handle.run(tree()).await.unwrap();
        runtime.announce_ready(3000);
        wait_for(&mut events, |e| matches!(e, SandboxEvent::Ready { .. })).await;
        runtime.announce_ready(3001);
        wait_for(&mut events, |e| matches!(e, SandboxEvent::Ready { .. })).await;

        assert_eq!(
            handle.status().preview.as_deref(),
            Some("http://localhost:3001")
        );
    }

    #[tokio::test]
    async fn output_is_forwarded_as_text() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let id = handle.run(tree()).await.unwrap();
        let process = runtime.last_process().unwrap();
        process.emit("Server listening\n");

        let event = wait_for(&mut events, |e| {
            matches!(e, SandboxEvent::Output { chunk, .. } if chunk.contains("listening"))
        })
        .await;
        assert!(matches!(event, SandboxEvent::Output { instance, .. } if instance == id));
    }

    #[tokio::test]
    async fn install_failure_returns_to_idle() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.install_exit_code.store(1, Ordering::SeqCst);
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let err = handle.run(tree()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Install { exit_code: Some(1) }));

        let seen = drain(&mut events);
        assert!(seen.iter().any(|e| matches!(e, SandboxEvent::Error { .. })));
        assert_eq!(handle.status().state, SandboxState::Idle);
        assert_eq!(runtime.running_count(), 0);
        assert_eq!(runtime.spawned_commands(), vec!["npm install"]);
    }

    #[tokio::test]
    async fn mount_failure_returns_to_idle() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_mount.store(true, Ordering::SeqCst);
        let handle = spawn_controller(runtime.clone());

        let err = handle.run(tree()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Mount(_)));
        assert_eq!(handle.status().state, SandboxState::Idle);
        assert!(runtime.spawned_commands().is_empty());
    }

    #[tokio::test]
    async fn kill_stops_running_instance() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());

        let id = handle.run(tree()).await.unwrap();
        handle.kill().await.unwrap();

        let status = handle.status();
        assert_eq!(status.state, SandboxState::Killed);
        assert_eq!(status.instance, Some(id));
        assert!(status.preview.is_none());
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn kill_when_idle_is_a_no_op() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime);
        let mut events = handle.subscribe();

        handle.kill().await.unwrap();
        assert_eq!(handle.status().state, SandboxState::Idle);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn run_after_kill_starts_fresh_instance() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());

        let first = handle.run(tree()).await.unwrap();
        handle.kill().await.unwrap();
        let second = handle.run(tree()).await.unwrap();

        assert!(second > first);
        assert_eq!(handle.status().state, SandboxState::Starting);
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn natural_exit_returns_to_idle() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let id = handle.run(tree()).await.unwrap();
        runtime.last_process().unwrap().exit(0);

        let event = wait_for(&mut events, |e| matches!(e, SandboxEvent::Exited { .. })).await;
        assert_eq!(
            event,
            SandboxEvent::Exited {
                instance: id,
                exit_code: Some(0)
            }
        );
        wait_for(&mut events, |e| {
            matches!(e, SandboxEvent::State(s) if s.state == SandboxState::Idle)
        })
        .await;
        assert!(handle.status().instance.is_none());
    }

    #[tokio::test]
    async fn mount_keeps_run_state() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = spawn_controller(runtime.clone());

        handle.mount(tree()).await.unwrap();
        assert_eq!(handle.status().state, SandboxState::Idle);
        assert!(handle.status().mounted);

        handle.run(tree()).await.unwrap();
        let mut next = tree();
        next.replace_file("index.js", "console.log(2)");
        handle.mount(next).await.unwrap();

        assert_eq!(handle.status().state, SandboxState::Starting);
        assert_eq!(runtime.mounts().len(), 3);
        assert_eq!(
            runtime.mounts().last().unwrap().get("index.js").map(String::as_str),
            Some("console.log(2)")
        );
    }

    async fn until_installing(events: &mut broadcast::Receiver<SandboxEvent>) -> InstanceId {
        let event = wait_for(events, |e| {
            matches!(e, SandboxEvent::State(s) if s.state == SandboxState::Installing)
        })
        .await;
        match event {
            SandboxEvent::State(s) => s.instance.unwrap(),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn run_waits_for_in_flight_install() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.hold_install.store(true, Ordering::SeqCst);
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let first_run = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run(tree()).await }
        });
        let first = until_installing(&mut events).await;

        let second_run = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run(tree()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second_run.is_finished());
        assert_eq!(runtime.mounts().len(), 1);
        assert_eq!(handle.status().state, SandboxState::Installing);
        assert_eq!(handle.status().instance, Some(first));

        runtime.hold_install.store(false, Ordering::SeqCst);
        runtime.release_installs();
        assert_eq!(first_run.await.unwrap().unwrap(), first);
        let second = second_run.await.unwrap().unwrap();

        let seen = states(&drain(&mut events));
        let first_starting = seen
            .iter()
            .position(|s| *s == (Some(first), SandboxState::Starting))
            .expect("first starting");
        let second_mounting = seen
            .iter()
            .position(|s| *s == (Some(second), SandboxState::Mounting))
            .expect("second mounting");
        assert!(first_starting < second_mounting);
        assert_eq!(runtime.mounts().len(), 2);
        assert_eq!(
            runtime.spawned_commands(),
            vec!["npm install", "npm start", "npm install", "npm start"]
        );
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn mount_waits_for_in_flight_install() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.hold_install.store(true, Ordering::SeqCst);
        let handle = spawn_controller(runtime.clone());
        let mut events = handle.subscribe();

        let run = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run(tree()).await }
        });
        until_installing(&mut events).await;

        let mut next = tree();
        next.replace_file("index.js", "console.log(2)");
        let mount = tokio::spawn({
            let handle = handle.clone();
            async move { handle.mount(next).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mount.is_finished());
        assert_eq!(runtime.mounts().len(), 1);

        runtime.release_installs();
        run.await.unwrap().unwrap();
        mount.await.unwrap().unwrap();

        assert_eq!(runtime.mounts().len(), 2);
        assert_eq!(handle.status().state, SandboxState::Starting);
    }
}
