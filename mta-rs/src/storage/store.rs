use super::message::{Message, NewMessage};
use super::threading::{build_index, normalize, Inbox, Thread};
use crate::error::{MailError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct StoreState {
    messages: Vec<Message>,
    index: HashMap<String, Inbox>,
}

impl StoreState {
    fn new(mut messages: Vec<Message>) -> Self {
        let report = normalize(&mut messages);
        if report.orphans > 0 || report.cycles_broken > 0 {
            warn!(
                "Message log repaired: {} orphaned repl(ies), {} cycle(s) broken",
                report.orphans, report.cycles_broken
            );
        }
        let index = build_index(&messages);
        Self { messages, index }
    }
}

/// Append-only message log with a derived per-identity thread index
///
/// The JSON array at `path` is the source of truth. Every mutation rewrites
/// it and rebuilds the index while holding the write lock.
pub struct MessageStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl MessageStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::new(Vec::new())),
        }
    }

    /// Load the log at `path`; a missing file is an empty log
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let messages: Vec<Message> = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                MailError::Storage(format!("Corrupt message log {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No message log at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!("Message log loaded: {} message(s)", messages.len());

        Ok(Self {
            path: Some(path),
            state: RwLock::new(StoreState::new(messages)),
        })
    }

    /// Persist a new message and return it with its id and thread assigned
    ///
    /// A `reply_to` naming an unknown message is dropped: the new message
    /// starts its own thread.
    pub async fn append(&self, new: NewMessage) -> Result<Message> {
        let mut stored = self.append_all(vec![new]).await?;
        stored
            .pop()
            .ok_or_else(|| MailError::Storage("Append produced no message".to_string()))
    }

    /// Persist several messages in one write: either all of them land or none
    pub async fn append_all(&self, batch: Vec<NewMessage>) -> Result<Vec<Message>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.write().await;

        let mut messages = state.messages.clone();
        let mut ids = Vec::with_capacity(batch.len());
        for new in batch {
            let mut message = new.into_message();
            if !message.reply_to.is_empty() && !messages.iter().any(|m| m.id == message.reply_to) {
                warn!(
                    "Parent {} of new message not found, starting a new thread",
                    message.reply_to
                );
                message.reply_to.clear();
            }
            ids.push(message.id.clone());
            messages.push(message);
        }
        self.commit(&mut state, messages).await?;

        let stored: Vec<Message> = ids
            .iter()
            .filter_map(|id| state.messages.iter().find(|m| &m.id == id).cloned())
            .collect();
        for message in &stored {
            debug!(
                "Stored message {} from {} to {} (thread {})",
                message.id, message.from_id, message.to_id, message.thread_id
            );
        }
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        let state = self.state.read().await;
        state.messages.iter().find(|m| m.id == id).cloned()
    }

    /// Look up by protocol `Message-ID`, angle brackets optional
    pub async fn find_by_message_id(&self, message_id: &str) -> Option<Message> {
        let state = self.state.read().await;
        find_message_id(&state.messages, message_id, None).cloned()
    }

    /// Map wire threading headers to a stored parent id
    ///
    /// `In-Reply-To` wins; otherwise each `References` token is tried in order.
    /// One inbound message fans out to a copy per local recipient, all sharing
    /// the same `Message-ID`; the copy involving `identity` is preferred.
    pub async fn resolve_parent(
        &self,
        identity: Option<&str>,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Option<String> {
        let state = self.state.read().await;

        in_reply_to
            .into_iter()
            .chain(references.iter().map(String::as_str))
            .find_map(|candidate| find_message_id(&state.messages, candidate, identity))
            .map(|m| m.id.clone())
    }

    pub async fn inbox(&self, identity: &str) -> Inbox {
        let state = self.state.read().await;
        state.index.get(identity).cloned().unwrap_or_default()
    }

    pub async fn thread(&self, identity: &str, thread_id: &str) -> Option<Thread> {
        let state = self.state.read().await;
        state
            .index
            .get(identity)
            .and_then(|inbox| inbox.threads.get(thread_id))
            .cloned()
    }

    pub async fn unread_count(&self, identity: &str) -> usize {
        let state = self.state.read().await;
        state.index.get(identity).map_or(0, |inbox| inbox.unread_count)
    }

    /// Returns false when the message does not exist or was already read
    pub async fn mark_read(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;

        let mut messages = state.messages.clone();
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };
        if message.read {
            return Ok(false);
        }
        message.read = true;

        self.commit(&mut state, messages).await?;
        Ok(true)
    }

    /// Remove one message, or its whole thread if it is a root with replies
    ///
    /// Returns the number of messages removed.
    pub async fn delete(&self, id: &str) -> Result<usize> {
        let mut state = self.state.write().await;

        let Some(target) = state.messages.iter().find(|m| m.id == id) else {
            return Err(MailError::NotFound(format!("Message {}", id)));
        };

        let has_replies = state.messages.iter().any(|m| m.reply_to == id);
        let thread_id = target.thread_id.clone();

        let messages: Vec<Message> = if target.is_root() && has_replies {
            info!("Deleting root {} removes its whole thread", id);
            state
                .messages
                .iter()
                .filter(|m| m.thread_id != thread_id)
                .cloned()
                .collect()
        } else {
            state.messages.iter().filter(|m| m.id != id).cloned().collect()
        };

        let removed = state.messages.len() - messages.len();
        self.commit(&mut state, messages).await?;
        Ok(removed)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;

        let messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.thread_id != thread_id)
            .cloned()
            .collect();

        let removed = state.messages.len() - messages.len();
        if removed == 0 {
            return Err(MailError::NotFound(format!("Thread {}", thread_id)));
        }

        self.commit(&mut state, messages).await?;
        info!("Deleted thread {} ({} message(s))", thread_id, removed);
        Ok(removed)
    }

    /// Snapshot of the log in insertion order
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.messages.is_empty()
    }

    /// Write `messages` to disk, then swap it in and rebuild the index
    ///
    /// On a write failure the in-memory state is left untouched.
    async fn commit(&self, state: &mut StoreState, mut messages: Vec<Message>) -> Result<()> {
        normalize(&mut messages);
        self.persist(&messages).await?;
        state.index = build_index(&messages);
        state.messages = messages;
        Ok(())
    }

    async fn persist(&self, messages: &[Message]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    MailError::Storage(format!("Failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(messages)?).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn bare_message_id(value: &str) -> &str {
    value.trim().trim_start_matches('<').trim_end_matches('>').trim()
}

fn find_message_id<'a>(
    messages: &'a [Message],
    message_id: &str,
    identity: Option<&str>,
) -> Option<&'a Message> {
    let wanted = bare_message_id(message_id);
    if wanted.is_empty() {
        return None;
    }

    let mut matches = messages
        .iter()
        .filter(|m| !m.message_id.is_empty() && bare_message_id(&m.message_id) == wanted);
    let first = matches.next()?;

    match identity {
        Some(identity) if !first.involves(identity) => Some(
            matches
                .find(|m| m.involves(identity))
                .unwrap_or(first),
        ),
        _ => Some(first),
    }
}
