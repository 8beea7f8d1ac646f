//! Workspace file tree.
//!
//! A flat map of opaque path keys to file contents. Paths are never split
//! into directories here; the sandbox runtime decides how to lay them out.
//! Concurrent edits resolve last-writer-wins per whole file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::store::ProjectStore;

/// File contents, wrapped the way clients send them: `{"file": {"contents": "..."}}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub file: FileContents,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub contents: String,
}

impl FileNode {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            file: FileContents {
                contents: contents.into(),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, FileNode>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(|node| node.file.contents.as_str())
    }

    /// Create or overwrite one file. Returns whether the tree changed.
    pub fn replace_file(&mut self, path: &str, content: &str) -> bool {
        if self.get(path) == Some(content) {
            return false;
        }
        self.0.insert(path.to_string(), FileNode::new(content));
        true
    }

    /// Swap in a whole new tree. Paths missing from `new_tree` are gone afterwards.
    pub fn replace_tree(&mut self, new_tree: FileTree) -> bool {
        if *self == new_tree {
            return false;
        }
        self.0 = new_tree.0;
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `path -> contents` view handed to the sandbox runtime
    pub fn to_mount_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(path, node)| (path.clone(), node.file.contents.clone()))
            .collect()
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(path, contents)| (path.into(), FileNode::new(contents)))
                .collect(),
        )
    }
}

/// A session's working copy of a project's tree.
///
/// Every change is handed to a background persister that writes the latest
/// snapshot to the store. Persistence is fire-and-forget: failures are
/// logged, never retried, and the in-memory tree is kept as is.
pub struct FileTreeModel {
    project_id: String,
    tree: FileTree,
    persist_tx: watch::Sender<FileTree>,
}

impl FileTreeModel {
    pub fn new(project_id: impl Into<String>, tree: FileTree, store: Arc<dyn ProjectStore>) -> Self {
        let project_id = project_id.into();
        let (persist_tx, persist_rx) = watch::channel(tree.clone());
        tokio::spawn(run_persister(project_id.clone(), persist_rx, store));

        Self {
            project_id,
            tree,
            persist_tx,
        }
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn snapshot(&self) -> FileTree {
        self.tree.clone()
    }

    pub fn replace_file(&mut self, path: &str, content: &str) -> bool {
        let changed = self.tree.replace_file(path, content);
        if changed {
            self.schedule_persist();
        }
        changed
    }

    pub fn replace_tree(&mut self, new_tree: FileTree) -> bool {
        let changed = self.tree.replace_tree(new_tree);
        if changed {
            self.schedule_persist();
        }
        changed
    }

    /// Replace the tree with one the store already holds. Nothing is written;
    /// the persister's pending snapshot is swapped for the new tree without
    /// waking it, so a queued older snapshot can never overwrite it.
    pub fn adopt_stored_tree(&mut self, new_tree: FileTree) -> bool {
        let changed = self.tree.replace_tree(new_tree);
        if changed {
            let latest = self.tree.clone();
            self.persist_tx.send_if_modified(|pending| {
                *pending = latest;
                false
            });
        }
        changed
    }

    fn schedule_persist(&self) {
        debug!(
            "Queueing file tree persist for project {} ({} files)",
            self.project_id,
            self.tree.len()
        );
        self.persist_tx.send_replace(self.tree.clone());
    }
}

/// Writes whichever snapshot is newest each time it wakes up. Intermediate
/// snapshots may be skipped; the last one is always written.
async fn run_persister(
    project_id: String,
    mut rx: watch::Receiver<FileTree>,
    store: Arc<dyn ProjectStore>,
) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Err(e) = store.persist_file_tree(&project_id, &snapshot).await {
            warn!("Failed to persist file tree for project {}: {:#}", project_id, e);
        }
    }
    debug!("File tree persister for project {} stopped", project_id);
}
