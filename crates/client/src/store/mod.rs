//! Persistence boundary. Every remote table the services touch sits behind one
//! of these traits; implementations map their transport failures to
//! [`ChatError::Connection`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::{ConversationId, MessageId, UserId};
use ciphertalk_shared::model::{
    Connection, Conversation, ConversationMember, GroupKeyRecord, KeyStatus, MemberRole, Message,
    NewKeyRecord, NewMessage, Profile, UserEncryptionKeyRecord,
};

pub use memory::MemoryStore;

#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn insert(&self, record: NewKeyRecord) -> Result<UserEncryptionKeyRecord, ChatError>;
    /// The user's newest non-revoked record.
    async fn find_active(&self, user_id: UserId)
        -> Result<Option<UserEncryptionKeyRecord>, ChatError>;
    async fn has_salted_key(&self, user_id: UserId) -> Result<bool, ChatError>;
    async fn has_any_key(&self, user_id: UserId) -> Result<bool, ChatError>;
    /// Marks every active record of the user revoked. Returns how many changed.
    async fn revoke(&self, user_id: UserId) -> Result<u64, ChatError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn insert(&self, conversation: Conversation) -> Result<Conversation, ChatError>;
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ChatError>;
    /// Direct conversation between two users, in either participant order.
    async fn find_direct(&self, a: UserId, b: UserId) -> Result<Option<Conversation>, ChatError>;
    /// Direct conversations the user participates in plus groups where they are
    /// an active member, most recent activity first.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, ChatError>;
    /// Every conversation the user ever took part in: direct ones, groups with
    /// any membership row (left included) and any conversation holding a
    /// message they sent.
    async fn list_involving(&self, user_id: UserId) -> Result<Vec<Conversation>, ChatError>;
    async fn set_name(&self, id: ConversationId, name: Option<String>) -> Result<(), ChatError>;
    /// Advances `current_key_version` from `expected` to `next`. Returns false,
    /// leaving the row untouched, when the stored version is not `expected`.
    async fn set_key_version(
        &self,
        id: ConversationId,
        expected: i32,
        next: i32,
    ) -> Result<bool, ChatError>;
    /// Flags a direct conversation as a group. Returns false if it already is one.
    async fn convert_to_group(
        &self,
        id: ConversationId,
        name: Option<String>,
    ) -> Result<bool, ChatError>;
    async fn revert_to_direct(&self, id: ConversationId) -> Result<(), ChatError>;
    async fn touch_last_message(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), ChatError>;
    /// Deletes the conversation together with its members, group keys and messages.
    async fn delete(&self, id: ConversationId) -> Result<(), ChatError>;
}

#[async_trait]
pub trait MemberRepository: Send + Sync {
    /// Inserts the member, or reactivates a previous row for the same user.
    async fn insert(&self, member: ConversationMember) -> Result<(), ChatError>;
    async fn get(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ConversationMember>, ChatError>;
    async fn list_active(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationMember>, ChatError>;
    async fn set_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<(), ChatError>;
    async fn set_key_status(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        status: KeyStatus,
    ) -> Result<(), ChatError>;
    async fn mark_left(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), ChatError>;
    async fn delete_for_conversation(&self, conversation_id: ConversationId)
        -> Result<(), ChatError>;
}

#[async_trait]
pub trait GroupKeyRepository: Send + Sync {
    /// Upserts on (conversation, version, member).
    async fn insert(&self, record: GroupKeyRecord) -> Result<(), ChatError>;
    async fn get(
        &self,
        conversation_id: ConversationId,
        key_version: i32,
        member_user_id: UserId,
    ) -> Result<Option<GroupKeyRecord>, ChatError>;
    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<GroupKeyRecord>, ChatError>;
    async fn delete_for_conversation(&self, conversation_id: ConversationId)
        -> Result<(), ChatError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Highest sequence number used in the conversation, 0 when empty.
    async fn last_sequence_number(&self, conversation_id: ConversationId) -> Result<i64, ChatError>;
    /// Rejects a sequence number already used in the conversation.
    async fn insert(&self, message: NewMessage) -> Result<Message, ChatError>;
    async fn get(&self, id: MessageId) -> Result<Option<Message>, ChatError>;
    async fn update_content(
        &self,
        id: MessageId,
        encrypted_content: String,
        initialization_vector: String,
        key_version: Option<i32>,
        edited_at: DateTime<Utc>,
    ) -> Result<Message, ChatError>;
    async fn mark_deleted(&self, id: MessageId) -> Result<(), ChatError>;
    /// Sets `read_at` on the given messages not sent by `reader` and not yet
    /// read. Returns how many changed.
    async fn mark_read(
        &self,
        ids: &[MessageId],
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, ChatError>;
    /// Non-deleted messages newest first, strictly below `before_sequence` if given.
    async fn list_page(
        &self,
        conversation_id: ConversationId,
        before_sequence: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError>;
    /// Every message including soft-deleted ones, oldest first.
    async fn list_all(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError>;
}

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Connection>, ChatError>;
    /// True when an accepted connection links the two users.
    async fn are_connected(&self, a: UserId, b: UserId) -> Result<bool, ChatError>;
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get(&self, user_id: UserId) -> Result<Option<Profile>, ChatError>;
}

/// Handles to every repository, shared by the services.
#[derive(Clone)]
pub struct Repositories {
    pub keys: Arc<dyn KeyRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub group_keys: Arc<dyn GroupKeyRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
}
