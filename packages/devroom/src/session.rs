//! Workspace session
//!
//! One per attached connection. Owns the connection's view of the project:
//! the message log, the working file tree and the last known preview
//! address. Driven by a single task; nothing here is shared across tasks.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::file_tree::{FileTree, FileTreeModel};
use crate::metrics::ServerMetrics;
use crate::models::{Message, Project, Sender, User};
use crate::protocol::{AgentResponse, RelayEvent};
use crate::relay::{ConnectionId, RelaySubscription, RoomRelay};
use crate::sandbox::{InstanceId, SandboxError, SandboxEvent, SandboxHandle, SandboxRegistry};
use crate::store::ProjectStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load project {id}: {source:#}")]
    LoadFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("project {0} not found")]
    NotFound(String),

    #[error("user {user} is not a member of project {project}")]
    NotMember { user: String, project: String },
}

/// Shared services a session attaches to
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn ProjectStore>,
    pub relay: Arc<RoomRelay>,
    pub sandboxes: Arc<SandboxRegistry>,
    pub metrics: Arc<ServerMetrics>,
}

/// What a relay event changed, for the owner of the session to render
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    Message(Message),
    FileTree(FileTree),
    Presence { user: User, joined: bool },
}

pub struct WorkspaceSession {
    project: Project,
    user: User,
    connection: ConnectionId,
    messages: Vec<Message>,
    files: FileTreeModel,
    subscription: RelaySubscription,
    sandbox: SandboxHandle,
    preview: Option<String>,
    deps: SessionDeps,
}

impl WorkspaceSession {
    /// Load the project and its log, join the room and announce presence.
    /// The log is read once here; later messages arrive through the relay.
    pub async fn attach(
        deps: SessionDeps,
        workspace_id: &str,
        user: User,
    ) -> Result<Self, SessionError> {
        let load_failed = |source| SessionError::LoadFailed {
            id: workspace_id.to_string(),
            source,
        };

        let project = deps
            .store
            .fetch_project(workspace_id)
            .await
            .map_err(load_failed)?
            .ok_or_else(|| SessionError::NotFound(workspace_id.to_string()))?;

        if !project.is_member(&user.id) {
            return Err(SessionError::NotMember {
                user: user.id.clone(),
                project: project.id.clone(),
            });
        }

        let messages = deps
            .store
            .fetch_messages(workspace_id)
            .await
            .map_err(load_failed)?;

        let connection = ConnectionId::next();
        let subscription = deps.relay.join(&project.id, connection).await;
        let sandbox = deps.sandboxes.get_or_create(&project.id).await;
        let files = FileTreeModel::new(&project.id, project.file_tree.clone(), deps.store.clone());
        let preview = sandbox.status().preview;

        deps.relay
            .publish(
                &project.id,
                connection,
                RelayEvent::Presence {
                    user: user.clone(),
                    joined: true,
                },
            )
            .await;

        info!(
            "{} ({}) attached to project {} with {} messages",
            user.email,
            connection,
            project.id,
            messages.len()
        );

        Ok(Self {
            project,
            user,
            connection,
            messages,
            files,
            subscription,
            sandbox,
            preview,
            deps,
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn file_tree(&self) -> &FileTree {
        self.files.tree()
    }

    pub fn preview(&self) -> Option<&str> {
        self.preview.as_deref()
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn subscribe_sandbox(&self) -> broadcast::Receiver<SandboxEvent> {
        self.sandbox.subscribe()
    }

    /// Append locally, then fan out to the room. The local log shows the
    /// message even if nobody else is connected. Blank text is ignored.
    pub async fn send_chat(&mut self, text: &str) -> Option<Message> {
        if text.trim().is_empty() {
            return None;
        }

        let message = Message::chat(Sender::from(&self.user), text, Utc::now());
        self.messages.push(message.clone());

        self.deps
            .relay
            .publish(
                &self.project.id,
                self.connection,
                RelayEvent::ProjectMessage {
                    sender: message.sender.clone(),
                    message: text.to_string(),
                    timestamp: message.timestamp,
                },
            )
            .await;

        self.persist_message(message.clone());
        Some(message)
    }

    /// Next event from the room. `None` once the relay dropped this connection.
    pub async fn next_relay_event(&mut self) -> Option<RelayEvent> {
        self.subscription.recv().await
    }

    /// Fold a relay event into the session. Never waits on the store or the
    /// sandbox, so the driving loop keeps reading while an install runs.
    pub fn apply_relay_event(&mut self, event: RelayEvent) -> Vec<SessionUpdate> {
        match event {
            RelayEvent::ProjectMessage {
                sender,
                message,
                timestamp,
            } => {
                debug!("Message in {} from {}", self.project.id, sender.id());
                if !sender.is_agent() {
                    let message = Message::chat(sender, message, timestamp);
                    self.messages.push(message.clone());
                    return vec![SessionUpdate::Message(message)];
                }

                let response = AgentResponse::parse_or_fallback(&message);
                let tree = response.file_tree.clone();
                let message = Message::agent(response, timestamp);
                self.messages.push(message.clone());

                let mut updates = vec![SessionUpdate::Message(message)];
                // Agent trees are stored and remounted once by the injection
                // endpoint; each session only refreshes its working copy
                if let Some(tree) = tree {
                    if self.files.adopt_stored_tree(tree) {
                        updates.push(SessionUpdate::FileTree(self.files.snapshot()));
                    }
                }
                updates
            }
            RelayEvent::Presence { user, joined } => {
                debug!("Presence in {}: {} joined={}", self.project.id, user.email, joined);
                vec![SessionUpdate::Presence { user, joined }]
            }
        }
    }

    /// A local edit. Persisted in the background; other members pick it up
    /// from the store.
    pub fn commit_edit(&mut self, path: &str, content: &str) -> bool {
        self.files.replace_file(path, content)
    }

    /// Run the current tree. The returned future does not borrow the session,
    /// so the driver can await it off its event loop.
    pub fn run(&self) -> impl Future<Output = Result<InstanceId, SandboxError>> + Send + 'static {
        let sandbox = self.sandbox.clone();
        let tree = self.files.snapshot();
        async move { sandbox.run(tree).await }
    }

    pub fn kill(&self) -> impl Future<Output = Result<(), SandboxError>> + Send + 'static {
        let sandbox = self.sandbox.clone();
        async move { sandbox.kill().await }
    }

    /// Bind the sandbox filesystem to the current tree without running anything
    pub fn mount(&self) -> impl Future<Output = Result<(), SandboxError>> + Send + 'static {
        let sandbox = self.sandbox.clone();
        let tree = self.files.snapshot();
        async move { sandbox.mount(tree).await }
    }

    pub fn apply_sandbox_event(&mut self, event: &SandboxEvent) {
        match event {
            SandboxEvent::Ready { address, .. } => self.preview = Some(address.clone()),
            SandboxEvent::Exited { .. } => self.preview = None,
            SandboxEvent::State(status) => self.preview = status.preview.clone(),
            SandboxEvent::Output { .. } | SandboxEvent::Error { .. } => {}
        }
    }

    /// Leave the room. The sandbox keeps running for the other members.
    pub async fn detach(self) {
        let relay = &self.deps.relay;
        relay
            .leave(self.subscription.workspace_id(), self.subscription.connection())
            .await;
        relay
            .publish(
                &self.project.id,
                self.connection,
                RelayEvent::Presence {
                    user: self.user.clone(),
                    joined: false,
                },
            )
            .await;
        info!(
            "{} ({}) detached from project {}",
            self.user.email, self.connection, self.project.id
        );
    }

    fn persist_message(&self, message: Message) {
        let store = self.deps.store.clone();
        let metrics = self.deps.metrics.clone();
        let project_id = self.project.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_message(&project_id, &message).await {
                metrics.store_error();
                warn!("Failed to persist message in {}: {:#}", project_id, e);
            }
        });
    }
}
