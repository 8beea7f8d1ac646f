use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::process::{ProcessActor, ProcessConfig};
use crate::ready::ReadyScanner;
use crate::runtime::{SandboxRuntime, ServerReady, SpawnedProcess};

/// Directories that survive a remount (installed dependencies)
const PRESERVED_DIRS: &[&str] = &["node_modules"];

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READY_CHANNEL_CAPACITY: usize = 16;

/// Runtime that mounts file trees into a host directory and runs processes there
pub struct LocalRuntime {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (ready_tx, _) = broadcast::channel(READY_CHANNEL_CAPACITY);
        Self {
            root: root.into(),
            ready_tx,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Resolve a tree path below `root`, rejecting anything that could escape it
pub(crate) fn resolve_path(root: &Path, path: &str) -> Result<PathBuf, RuntimeError> {
    let relative = Path::new(path);
    if path.is_empty() {
        return Err(RuntimeError::InvalidPath(path.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(RuntimeError::InvalidPath(path.to_string())),
        }
    }

    if resolved == root {
        return Err(RuntimeError::InvalidPath(path.to_string()));
    }
    Ok(resolved)
}

fn mount_blocking(root: &Path, files: &BTreeMap<String, String>) -> Result<(), RuntimeError> {
    // Validate everything before touching the disk so a bad path leaves the old mount intact
    let targets = files
        .iter()
        .map(|(path, contents)| Ok((resolve_path(root, path)?, contents)))
        .collect::<Result<Vec<_>, RuntimeError>>()?;

    std::fs::create_dir_all(root).map_err(|e| RuntimeError::MountFailed(e.to_string()))?;

    let keep: HashSet<PathBuf> = targets.iter().map(|(p, _)| p.clone()).collect();
    remove_stale(root, root, &keep)?;

    for (target, contents) in targets {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RuntimeError::MountFailed(format!("{}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&target, contents)
            .map_err(|e| RuntimeError::MountFailed(format!("{}: {}", target.display(), e)))?;
    }

    Ok(())
}

/// Delete files under `dir` that are not part of the new tree, pruning directories left empty
fn remove_stale(root: &Path, dir: &Path, keep: &HashSet<PathBuf>) -> Result<(), RuntimeError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RuntimeError::MountFailed(e.to_string()))?;

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let preserved = dir == root
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| PRESERVED_DIRS.contains(&n));
            if preserved {
                continue;
            }
            remove_stale(root, &path, keep)?;
            if std::fs::read_dir(&path).is_ok_and(|mut d| d.next().is_none()) {
                let _ = std::fs::remove_dir(&path);
            }
        } else if !keep.contains(&path) {
            debug!("Removing stale sandbox file {}", path.display());
            std::fs::remove_file(&path).map_err(|e| RuntimeError::MountFailed(e.to_string()))?;
        }
    }

    Ok(())
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn mount(&self, files: &BTreeMap<String, String>) -> Result<(), RuntimeError> {
        let root = self.root.clone();
        let files = files.clone();
        let count = files.len();

        tokio::task::spawn_blocking(move || mount_blocking(&root, &files))
            .await
            .map_err(|e| RuntimeError::MountFailed(e.to_string()))??;

        info!("Mounted {} files into {}", count, self.root.display());
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, RuntimeError> {
        let config = ProcessConfig {
            command: command.to_string(),
            args: args.to_vec(),
            working_dir: Some(self.root.clone()),
        };

        let (handle, mut pty_rx) = ProcessActor::spawn(config)?;

        // Re-broadcast through a scanner so ready detection sees the very first line
        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let ready_tx = self.ready_tx.clone();
        let label = format!("{} {}", command, args.join(" "));

        tokio::spawn(async move {
            let mut scanner = ReadyScanner::new();
            loop {
                match pty_rx.recv().await {
                    Ok(output) => {
                        for ready in scanner.feed(&output.data) {
                            info!("'{}' is ready at {}", label, ready.address);
                            let _ = ready_tx.send(ready);
                        }
                        let _ = output_tx.send(output);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Output scanner for '{}' lagged by {} chunks", label, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(SpawnedProcess {
            process: Arc::new(handle),
            output: output_rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SandboxProcess;

    fn tree(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let root = Path::new("/sandbox");
        assert!(resolve_path(root, "../etc/passwd").is_err());
        assert!(resolve_path(root, "/etc/passwd").is_err());
        assert!(resolve_path(root, "src/../../x").is_err());
        assert!(resolve_path(root, "").is_err());
        assert!(resolve_path(root, ".").is_err());
        assert_eq!(
            resolve_path(root, "./src/index.js").unwrap(),
            PathBuf::from("/sandbox/src/index.js")
        );
    }

    #[tokio::test]
    async fn mount_writes_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path().join("ws"));

        runtime
            .mount(&tree(&[
                ("package.json", "{}"),
                ("src/app.js", "console.log(1)"),
            ]))
            .await
            .unwrap();

        let root = runtime.root();
        assert_eq!(std::fs::read_to_string(root.join("package.json")).unwrap(), "{}");
        assert_eq!(
            std::fs::read_to_string(root.join("src/app.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[tokio::test]
    async fn remount_removes_vanished_files_but_keeps_node_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path());

        runtime
            .mount(&tree(&[("old.js", "1"), ("lib/util.js", "2")]))
            .await
            .unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/left-pad")).unwrap();
        std::fs::write(tmp.path().join("node_modules/left-pad/index.js"), "x").unwrap();

        runtime.mount(&tree(&[("new.js", "3")])).await.unwrap();

        assert!(!tmp.path().join("old.js").exists());
        assert!(!tmp.path().join("lib").exists());
        assert!(tmp.path().join("new.js").exists());
        assert!(tmp.path().join("node_modules/left-pad/index.js").exists());
    }

    #[tokio::test]
    async fn mount_with_bad_path_leaves_previous_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path());
        runtime.mount(&tree(&[("keep.js", "1")])).await.unwrap();

        let err = runtime
            .mount(&tree(&[("fine.js", "2"), ("../escape.js", "3")]))
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidPath(_)));
        assert!(tmp.path().join("keep.js").exists());
        assert!(!tmp.path().join("fine.js").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_reports_server_ready_from_output() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path());
        runtime.mount(&tree(&[("a.txt", "hi")])).await.unwrap();

        let mut ready = runtime.server_ready();
        let spawned = runtime
            .spawn(
                "/bin/sh",
                &[
                    "-c".to_string(),
                    "cat a.txt; echo; echo 'listening on http://localhost:4567'; sleep 5".to_string(),
                ],
            )
            .await
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(10), ready.recv())
            .await
            .expect("ready in time")
            .unwrap();
        assert_eq!(got.port, 4567);

        spawned.process.terminate().await.unwrap();
        spawned.process.wait().await;
    }
}
