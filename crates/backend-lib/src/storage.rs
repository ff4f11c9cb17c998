// ============================
// chathub-backend-lib/src/storage.rs
// ============================
//! Message and presence store abstractions with in-memory and flat-file implementations.
use crate::error::AppError;
use async_trait::async_trait;
use chathub_common::{ChatMessage, ConversationSummary, MessageId, NewMessage, Presence};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::{fs as tokio_fs, io::AsyncWriteExt, sync::Mutex};

/// Durable store of record for chat messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message, assigning its id and timestamp
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, AppError>;

    /// Mark every unread message from `sender_id` to `receiver_id` as read.
    /// Returns the number of messages that changed.
    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64, AppError>;

    /// Count unread messages addressed to `user_id`
    async fn unread_count(&self, user_id: &str) -> Result<u64, AppError>;

    /// All messages exchanged between two users, oldest first
    async fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<ChatMessage>, AppError>;

    /// One summary per peer `user_id` has exchanged messages with,
    /// most recently active first
    async fn conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError>;
}

/// Best-effort store of online flags and last-seen timestamps.
///
/// Updates are last-write-wins on `at`: one stamped before the stored
/// last-seen is ignored.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Set the online flag, also refreshing last-seen
    async fn set_online(&self, user_id: &str, online: bool, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Refresh last-seen without touching the online flag
    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Current presence record for a user, if any
    async fn presence(&self, user_id: &str) -> Result<Option<Presence>, AppError>;
}

/// In-memory message index shared by both store implementations
#[derive(Default)]
struct MessageIndex {
    messages: Vec<ChatMessage>,
    positions: HashMap<MessageId, usize>,
}

impl MessageIndex {
    fn push(&mut self, message: ChatMessage) {
        self.positions.insert(message.id, self.messages.len());
        self.messages.push(message);
    }

    fn unread_between(&self, receiver_id: &str, sender_id: &str) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| !m.read && m.receiver_id == receiver_id && m.sender_id == sender_id)
            .map(|m| m.id)
            .collect()
    }

    fn set_read(&mut self, ids: &[MessageId]) -> u64 {
        let mut changed = 0;
        for id in ids {
            if let Some(&pos) = self.positions.get(id) {
                let message = &mut self.messages[pos];
                if !message.read {
                    message.read = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn unread_count(&self, user_id: &str) -> u64 {
        self.messages
            .iter()
            .filter(|m| !m.read && m.receiver_id == user_id)
            .count() as u64
    }

    fn conversation(&self, user_a: &str, user_b: &str) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.receiver_id == user_b)
                    || (m.sender_id == user_b && m.receiver_id == user_a)
            })
            .cloned()
            .collect()
    }

    fn conversations(&self, user_id: &str) -> Vec<ConversationSummary> {
        let mut by_peer: HashMap<&str, ConversationSummary> = HashMap::new();
        for message in &self.messages {
            let peer = if message.sender_id == user_id {
                message.receiver_id.as_str()
            } else if message.receiver_id == user_id {
                message.sender_id.as_str()
            } else {
                continue;
            };
            let unread = u64::from(!message.read && message.receiver_id == user_id);

            let summary = by_peer.entry(peer).or_insert_with(|| ConversationSummary {
                user_id: peer.to_string(),
                last_message: message.clone(),
                unread_count: 0,
            });
            summary.unread_count += unread;
            if message.created_at >= summary.last_message.created_at {
                summary.last_message = message.clone();
            }
        }

        let mut summaries: Vec<_> = by_peer.into_values().collect();
        summaries.sort_by(|a, b| {
            b.last_message
                .created_at
                .cmp(&a.last_message.created_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        summaries
    }
}

/// Apply one presence update to an existing record.
/// Returns false when the update is older than what the record already holds.
fn apply_presence(record: &mut Presence, online: Option<bool>, at: DateTime<Utc>) -> bool {
    if at < record.last_seen {
        return false;
    }
    if let Some(online) = online {
        record.online = online;
    }
    record.last_seen = at;
    true
}

fn upsert_presence(
    records: &mut HashMap<String, Presence>,
    user_id: &str,
    online: Option<bool>,
    at: DateTime<Utc>,
) -> bool {
    match records.get_mut(user_id) {
        Some(record) => apply_presence(record, online, at),
        None => {
            records.insert(
                user_id.to_string(),
                Presence {
                    user_id: user_id.to_string(),
                    online: online.unwrap_or(false),
                    last_seen: at,
                },
            );
            true
        },
    }
}

/// Replay `messages.log` into `index`, returning how many leading bytes hold
/// complete entries.
///
/// An unparsable final line is what a crash mid-append leaves behind; it is
/// skipped. An unparsable line anywhere else is an error.
fn replay_log(content: &[u8], index: &mut MessageIndex) -> Result<usize, AppError> {
    let mut valid_len = 0;
    let mut lines = content.split_inclusive(|&b| b == b'\n').peekable();
    while let Some(line) = lines.next() {
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<LogEntry>(line) {
                Ok(LogEntry::Message(message)) => index.push(message),
                Ok(LogEntry::Read { ids }) => {
                    index.set_read(&ids);
                },
                Err(e) if lines.peek().is_none() => {
                    tracing::warn!(
                        error = %e,
                        offset = valid_len,
                        bytes = line.len(),
                        "skipping torn entry at the end of messages.log"
                    );
                    break;
                },
                Err(e) => return Err(e.into()),
            }
        }
        valid_len += line.len();
    }
    Ok(valid_len)
}

/// Volatile store, used in tests and for running without a data directory
#[derive(Default)]
pub struct MemoryStorage {
    messages: parking_lot::RwLock<MessageIndex>,
    presence: DashMap<String, Presence>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages
    pub fn len(&self) -> usize {
        self.messages.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStorage {
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, AppError> {
        let message = message.into_message();
        self.messages.write().push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64, AppError> {
        let mut index = self.messages.write();
        let ids = index.unread_between(receiver_id, sender_id);
        Ok(index.set_read(&ids))
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, AppError> {
        Ok(self.messages.read().unread_count(user_id))
    }

    async fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<ChatMessage>, AppError> {
        Ok(self.messages.read().conversation(user_a, user_b))
    }

    async fn conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError> {
        Ok(self.messages.read().conversations(user_id))
    }
}

#[async_trait]
impl PresenceStore for MemoryStorage {
    async fn set_online(&self, user_id: &str, online: bool, at: DateTime<Utc>) -> Result<(), AppError> {
        self.presence
            .entry(user_id.to_string())
            .and_modify(|p| {
                apply_presence(p, Some(online), at);
            })
            .or_insert_with(|| Presence {
                user_id: user_id.to_string(),
                online,
                last_seen: at,
            });
        Ok(())
    }

    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        self.presence
            .entry(user_id.to_string())
            .and_modify(|p| {
                apply_presence(p, None, at);
            })
            .or_insert_with(|| Presence {
                user_id: user_id.to_string(),
                online: false,
                last_seen: at,
            });
        Ok(())
    }

    async fn presence(&self, user_id: &str) -> Result<Option<Presence>, AppError> {
        Ok(self.presence.get(user_id).map(|p| p.clone()))
    }
}

/// One line of `messages.log`
#[derive(Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogEntry {
    Message(ChatMessage),
    Read { ids: Vec<MessageId> },
}

/// Flat-file implementation of both stores.
///
/// Messages live in an append-only JSON-lines log that is replayed on open;
/// presence is a JSON snapshot rewritten on every change.
pub struct FlatFileStorage {
    root: PathBuf,
    messages: Mutex<MessageIndex>,
    presence: Mutex<HashMap<String, Presence>>,
}

impl FlatFileStorage {
    /// Open (or create) the stores under `root`, replaying existing data
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        tokio_fs::create_dir_all(&root).await?;

        let mut index = MessageIndex::default();
        let log_path = root.join("messages.log");
        if tokio_fs::try_exists(&log_path).await? {
            let content = tokio_fs::read(&log_path).await?;
            let valid_len = replay_log(&content, &mut index)?;
            if valid_len < content.len() {
                // drop the torn tail so the next append starts on a clean line
                let file = tokio_fs::OpenOptions::new().write(true).open(&log_path).await?;
                file.set_len(valid_len as u64).await?;
            } else if content.last().is_some_and(|&b| b != b'\n') {
                let mut file = tokio_fs::OpenOptions::new().append(true).open(&log_path).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }

        let presence_path = root.join("presence.json");
        let presence = if tokio_fs::try_exists(&presence_path).await? {
            let content = tokio_fs::read_to_string(&presence_path).await?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };

        tracing::info!(
            root = %root.display(),
            messages = index.messages.len(),
            "flat-file storage opened"
        );

        Ok(Self {
            root,
            messages: Mutex::new(index),
            presence: Mutex::new(presence),
        })
    }

    async fn append(&self, entry: &LogEntry) -> Result<(), AppError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("messages.log"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_presence(&self, records: &HashMap<String, Presence>) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.root.join("presence.json.tmp");
        tokio_fs::write(&tmp, json).await?;
        tokio_fs::rename(tmp, self.root.join("presence.json")).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FlatFileStorage {
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, AppError> {
        let message = message.into_message();
        // the lock is held across the append so log order matches index order
        let mut index = self.messages.lock().await;
        self.append(&LogEntry::Message(message.clone())).await?;
        index.push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64, AppError> {
        let mut index = self.messages.lock().await;
        let ids = index.unread_between(receiver_id, sender_id);
        if ids.is_empty() {
            return Ok(0);
        }
        self.append(&LogEntry::Read { ids: ids.clone() }).await?;
        Ok(index.set_read(&ids))
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, AppError> {
        Ok(self.messages.lock().await.unread_count(user_id))
    }

    async fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<ChatMessage>, AppError> {
        Ok(self.messages.lock().await.conversation(user_a, user_b))
    }

    async fn conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError> {
        Ok(self.messages.lock().await.conversations(user_id))
    }
}

#[async_trait]
impl PresenceStore for FlatFileStorage {
    async fn set_online(&self, user_id: &str, online: bool, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut records = self.presence.lock().await;
        if !upsert_presence(&mut records, user_id, Some(online), at) {
            return Ok(());
        }
        self.write_presence(&records).await
    }

    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut records = self.presence.lock().await;
        if !upsert_presence(&mut records, user_id, None, at) {
            return Ok(());
        }
        self.write_presence(&records).await
    }

    async fn presence(&self, user_id: &str) -> Result<Option<Presence>, AppError> {
        Ok(self.presence.lock().await.get(user_id).cloned())
    }
}
