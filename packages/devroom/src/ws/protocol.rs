//! WebSocket Protocol Types
//!
//! Frames exchanged between a workspace client and its server-side session.

use serde::{Deserialize, Serialize};

use crate::file_tree::FileTree;
use crate::models::{Message, Project, User};
use crate::sandbox::{InstanceId, SandboxEvent, SandboxStatus};
use crate::session::SessionUpdate;

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Post a chat message to the room
    Chat { text: String },
    /// Overwrite one file of the working tree
    EditFile { path: String, content: String },
    /// Mount, install and start the current tree, replacing any running instance
    Run,
    /// Stop the running instance
    Kill,
    /// Bind the sandbox filesystem to the current tree without starting anything
    Mount,
}

/// Project header sent in the initial snapshot (the tree travels separately)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
}

impl From<&Project> for ProjectSummary {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id.clone(),
            name: project.name.clone(),
            members: project.members.clone(),
        }
    }
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Everything a freshly attached client needs to render the workspace
    Snapshot {
        project: ProjectSummary,
        messages: Vec<Message>,
        file_tree: FileTree,
        sandbox: SandboxStatus,
    },
    Message {
        message: Message,
    },
    /// The working tree was replaced wholesale
    FileTree {
        file_tree: FileTree,
    },
    SandboxState {
        status: SandboxStatus,
    },
    SandboxOutput {
        instance: InstanceId,
        chunk: String,
    },
    SandboxExited {
        instance: InstanceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Where the running program can be reached; `None` when nothing is serving
    Preview {
        address: Option<String>,
    },
    Presence {
        user: User,
        joined: bool,
    },
    Error {
        message: String,
    },
}

impl From<SessionUpdate> for ServerMessage {
    fn from(update: SessionUpdate) -> Self {
        match update {
            SessionUpdate::Message(message) => ServerMessage::Message { message },
            SessionUpdate::FileTree(file_tree) => ServerMessage::FileTree { file_tree },
            SessionUpdate::Presence { user, joined } => ServerMessage::Presence { user, joined },
        }
    }
}

impl From<SandboxEvent> for ServerMessage {
    fn from(event: SandboxEvent) -> Self {
        match event {
            SandboxEvent::State(status) => ServerMessage::SandboxState { status },
            SandboxEvent::Output { instance, chunk } => {
                ServerMessage::SandboxOutput { instance, chunk }
            }
            SandboxEvent::Ready { address, .. } => ServerMessage::Preview {
                address: Some(address),
            },
            SandboxEvent::Exited {
                instance,
                exit_code,
            } => ServerMessage::SandboxExited {
                instance,
                exit_code,
            },
            SandboxEvent::Error { message, .. } => ServerMessage::Error { message },
        }
    }
}
