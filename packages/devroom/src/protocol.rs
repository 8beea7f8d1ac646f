//! Room message protocol.
//!
//! Chat messages carry plain text. Agent messages carry a serialized JSON
//! document `{"text": "...", "fileTree": {...}}` that every recipient parses
//! on arrival. A document that does not parse is replaced with a fixed
//! fallback so a broken agent reply never ends a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::file_tree::FileTree;
use crate::models::{Sender, User};

/// Reserved sender identity of the automated participant
pub const AGENT_SENDER: &str = "agent";

/// Text shown in place of an agent payload that could not be parsed
pub const INVALID_MESSAGE_TEXT: &str = "Invalid message format.";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("agent payload is not a valid document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("agent payload is not a JSON object")]
    NotAnObject,
}

/// Structured reply from the agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<FileTree>,
}

impl AgentResponse {
    pub fn fallback() -> Self {
        Self {
            text: INVALID_MESSAGE_TEXT.to_string(),
            file_tree: None,
        }
    }

    /// Validate a raw agent payload: an object with a string `text` and an
    /// optional `fileTree` in the file tree wire shape.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        // Derived struct deserializers also accept sequences
        let value: serde_json::Value = serde_json::from_str(payload)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn parse_or_fallback(payload: &str) -> Self {
        match Self::parse(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("Discarding agent payload ({} bytes): {}", payload.len(), e);
                Self::fallback()
            }
        }
    }
}

/// Events fanned out to the other members of a room
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// `message` is chat text, or the raw agent document when `sender` is the agent
    ProjectMessage {
        sender: Sender,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Presence {
        user: User,
        joined: bool,
    },
}
