use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored message
///
/// Immutable once created except for `read`. `thread_id` is derived by the
/// store and recomputed whenever the log is loaded or changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Display name of the sender
    pub from: String,
    /// Stable sender identity: address for external senders, username for local ones
    pub from_id: String,
    pub to: String,
    pub to_id: String,
    pub subject: String,
    /// Decoded, render-ready body
    pub body: String,
    /// Id of the message being answered, empty if none
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub thread_id: String,
    /// Protocol-level Message-ID, empty for purely internal messages
    #[serde(default)]
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.reply_to.is_empty()
    }

    /// Whether `identity` is the sender or the recipient
    pub fn involves(&self, identity: &str) -> bool {
        self.from_id == identity || self.to_id == identity
    }
}

/// Everything the caller supplies when appending to the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMessage {
    pub from: String,
    pub from_id: String,
    pub to: String,
    pub to_id: String,
    pub subject: String,
    pub body: String,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
}

impl NewMessage {
    pub(crate) fn into_message(self) -> Message {
        Message {
            id: generate_id(),
            from: self.from,
            from_id: self.from_id,
            to: self.to,
            to_id: self.to_id,
            subject: self.subject,
            body: self.body,
            reply_to: self.reply_to.unwrap_or_default(),
            thread_id: String::new(),
            message_id: self.message_id.unwrap_or_default(),
            created_at: Utc::now(),
            read: false,
        }
    }
}

/// Time-ordered opaque id
pub fn generate_id() -> String {
    Uuid::now_v7().simple().to_string()
}
