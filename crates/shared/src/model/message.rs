use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

/// An encrypted message as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub initialization_vector: String,
    /// Strictly increasing per conversation, never reused.
    pub sequence_number: i64,
    /// Group key version used to encrypt; `None` for direct messages.
    pub key_version: Option<i32>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a message. `sequence_number` is assigned by the sender
/// as last sequence + 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub initialization_vector: String,
    pub sequence_number: i64,
    pub key_version: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// A message after client-side decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    /// False when `content` is a placeholder for an undecryptable message.
    pub decrypted: bool,
    pub sequence_number: i64,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One page of history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<DecryptedMessage>,
    /// Pass as the cursor to fetch the next (older) page.
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}
