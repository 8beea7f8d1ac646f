use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::file_tree::FileTree;
use crate::protocol::{AGENT_SENDER, AgentResponse};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    #[serde(rename = "fileTree")]
    pub file_tree: FileTree,
}

impl Project {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

/// Who wrote a message. The agent is a participant without a stored user row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sender {
    User { id: String, email: String },
    Agent,
}

impl Sender {
    pub fn id(&self) -> &str {
        match self {
            Sender::User { id, .. } => id,
            Sender::Agent => AGENT_SENDER,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Sender::Agent)
    }
}

impl From<&User> for Sender {
    fn from(user: &User) -> Self {
        Sender::User {
            id: user.id.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Chat { text: String },
    Agent { response: AgentResponse },
}

/// One entry in a project's message log. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn chat(sender: Sender, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender,
            body: MessageBody::Chat { text: text.into() },
            timestamp,
        }
    }

    pub fn agent(response: AgentResponse, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender: Sender::Agent,
            body: MessageBody::Agent { response },
            timestamp,
        }
    }

    /// The text shown to participants
    pub fn text(&self) -> &str {
        match &self.body {
            MessageBody::Chat { text } => text,
            MessageBody::Agent { response } => &response.text,
        }
    }
}
