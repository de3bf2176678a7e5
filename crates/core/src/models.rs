//! Observable session models.
//!
//! These are the structures the presentation layer reads: the connection
//! status, the authentication flags, and the append-only chat log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Last known state of the connection to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// Flags describing the session as seen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionState {
    pub connection_status: ConnectionStatus,
    pub is_authenticated: bool,
    /// Cleared by a watchdog after a fixed delay even if the server never answers.
    pub is_authenticating: bool,
    /// Only true while the connection is open and not yet authenticated.
    pub can_authenticate: bool,
    pub is_meeting_active: bool,
    pub has_stored_credentials: bool,
}

impl SessionState {
    /// The state at the start of every connection attempt.
    pub fn connecting(has_stored_credentials: bool) -> Self {
        Self {
            connection_status: ConnectionStatus::Connecting,
            has_stored_credentials,
            ..Self::default()
        }
    }
}

/// Who a chat record is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    /// The remote assistant.
    Remote,
    /// The client itself (connection and authentication notices).
    System,
    /// The local user.
    Local,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Remote => write!(f, "remote"),
            Author::System => write!(f, "system"),
            Author::Local => write!(f, "local"),
        }
    }
}

/// What a chat record's content holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Image,
    Audio,
    Text,
}

/// One entry of the chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRecord {
    pub id: Uuid,
    pub author: Author,
    pub kind: RecordKind,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ChatRecord {
    pub fn new(author: Author, kind: RecordKind, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// A text notice authored by the client.
    pub fn system(text: &str) -> Self {
        Self::new(Author::System, RecordKind::Text, text)
    }

    /// The content as UTF-8, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}
