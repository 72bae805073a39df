//! Encrypted messaging: send (with offline fallback), history, edit, delete
//! and read receipts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ciphertalk_crypto::{
    decrypt_message, derive_shared_secret, encrypt_message, DerivedKeyPair, SymmetricKey,
};
use ciphertalk_shared::constants::{
    KEYS_UNAVAILABLE_PLACEHOLDER, MAX_HISTORY_PAGE_SIZE, UNDECRYPTABLE_PLACEHOLDER,
};
use ciphertalk_shared::error::{ChatError, GroupErrorCode};
use ciphertalk_shared::ids::{ConversationId, MessageId, QueueItemId, UserId};
use ciphertalk_shared::model::{Conversation, DecryptedMessage, Message, MessagePage, NewMessage};

use crate::auth::{require_user, AuthProvider};
use crate::config::MessagePolicy;
use crate::connectivity::Connectivity;
use crate::group_keys::GroupKeyService;
use crate::keys::KeyManagementService;
use crate::queue::{MessageQueue, QueuedMessage, SyncResult};
use crate::store::Repositories;

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct EditMessageRequest {
    pub message_id: MessageId,
    pub new_content: String,
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent(Message),
    /// Stored locally; delivered by a later queue drain.
    Queued(QueueItemId),
}

impl SendOutcome {
    pub fn queued(&self) -> bool {
        matches!(self, SendOutcome::Queued(_))
    }
}

/// Insert with the conversation's next sequence number and bump its
/// `last_message_at`.
pub(crate) async fn persist_message(
    repos: &Repositories,
    mut message: NewMessage,
) -> Result<Message, ChatError> {
    message.sequence_number = repos
        .messages
        .last_sequence_number(message.conversation_id)
        .await?
        + 1;
    let stored = repos.messages.insert(message).await?;
    if let Err(e) = repos
        .conversations
        .touch_last_message(stored.conversation_id, stored.created_at)
        .await
    {
        tracing::warn!(conversation_id = %stored.conversation_id, error = %e, "failed to update last_message_at");
    }
    Ok(stored)
}

/// The other participant recorded on a (possibly upgraded) direct conversation.
fn counterpart(conversation: &Conversation, me: UserId) -> Option<UserId> {
    [conversation.participant_1_id, conversation.participant_2_id]
        .into_iter()
        .flatten()
        .find(|&p| p != me)
}

/// Decrypts messages for one reader, caching pairwise secrets per peer.
pub(crate) struct MessageDecryptor<'a> {
    keys: &'a KeyManagementService,
    group_keys: &'a GroupKeyService,
    me: UserId,
    pair: Arc<DerivedKeyPair>,
    pairwise: HashMap<UserId, SymmetricKey>,
}

impl<'a> MessageDecryptor<'a> {
    pub(crate) fn new(
        keys: &'a KeyManagementService,
        group_keys: &'a GroupKeyService,
        me: UserId,
        pair: Arc<DerivedKeyPair>,
    ) -> Self {
        Self {
            keys,
            group_keys,
            me,
            pair,
            pairwise: HashMap::new(),
        }
    }

    async fn pairwise_key(&mut self, peer: UserId) -> Result<SymmetricKey, ChatError> {
        if let Some(key) = self.pairwise.get(&peer) {
            return Ok(key.clone());
        }
        let peer_key = self
            .keys
            .get_user_public_key(peer)
            .await?
            .ok_or(ChatError::NotFound("peer public key"))?;
        let key = derive_shared_secret(self.pair.private_key(), &peer_key)?;
        self.pairwise.insert(peer, key.clone());
        Ok(key)
    }

    pub(crate) async fn decrypt(
        &mut self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<String, ChatError> {
        let key = match message.key_version {
            Some(version) => {
                self.group_keys
                    .get_group_key(conversation.id, version)
                    .await?
            }
            None => {
                let peer = if message.sender_id != self.me {
                    message.sender_id
                } else {
                    counterpart(conversation, self.me)
                        .ok_or(ChatError::NotFound("conversation peer"))?
                };
                self.pairwise_key(peer).await?
            }
        };
        Ok(decrypt_message(
            &message.encrypted_content,
            &message.initialization_vector,
            &key,
        )?)
    }
}

fn to_decrypted(message: &Message, content: String, decrypted: bool) -> DecryptedMessage {
    DecryptedMessage {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        content,
        decrypted,
        sequence_number: message.sequence_number,
        edited: message.edited,
        edited_at: message.edited_at,
        read_at: message.read_at,
        created_at: message.created_at,
    }
}

pub struct MessageService {
    repos: Repositories,
    auth: Arc<dyn AuthProvider>,
    keys: Arc<KeyManagementService>,
    group_keys: Arc<GroupKeyService>,
    queue: Arc<MessageQueue>,
    connectivity: Arc<dyn Connectivity>,
    policy: MessagePolicy,
}

impl MessageService {
    pub fn new(
        repos: Repositories,
        auth: Arc<dyn AuthProvider>,
        keys: Arc<KeyManagementService>,
        group_keys: Arc<GroupKeyService>,
        queue: Arc<MessageQueue>,
        connectivity: Arc<dyn Connectivity>,
        policy: MessagePolicy,
    ) -> Self {
        Self {
            repos,
            auth,
            keys,
            group_keys,
            queue,
            connectivity,
            policy,
        }
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    fn validate_content<'c>(&self, content: &'c str) -> Result<&'c str, ChatError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::validation("content", "message cannot be empty"));
        }
        if trimmed.chars().count() > self.policy.max_length {
            return Err(ChatError::validation(
                "content",
                format!(
                    "message must be at most {} characters",
                    self.policy.max_length
                ),
            ));
        }
        Ok(trimmed)
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Conversation, ChatError> {
        self.repos
            .conversations
            .get(id)
            .await?
            .ok_or(ChatError::NotFound("conversation"))
    }

    async fn require_participant(
        &self,
        user_id: UserId,
        conversation: &Conversation,
    ) -> Result<(), ChatError> {
        let allowed = if conversation.is_group {
            self.repos
                .members
                .get(conversation.id, user_id)
                .await?
                .is_some_and(|m| m.is_active())
        } else {
            conversation.is_direct_participant(user_id)
        };
        if !allowed {
            return Err(ChatError::group(
                GroupErrorCode::NotMember,
                "not a participant of this conversation",
            ));
        }
        Ok(())
    }

    /// Key for new content in `conversation`: the current group key, or the
    /// pairwise secret with the direct peer.
    async fn outgoing_key(
        &self,
        user_id: UserId,
        pair: &DerivedKeyPair,
        conversation: &Conversation,
    ) -> Result<(SymmetricKey, Option<i32>), ChatError> {
        if conversation.is_group {
            let version = conversation.current_key_version;
            let key = self
                .group_keys
                .get_group_key(conversation.id, version)
                .await
                .map_err(|e| match e {
                    ChatError::Connection(_) => e,
                    other => {
                        tracing::warn!(conversation_id = %conversation.id, error = %other, "group key unavailable");
                        ChatError::validation(
                            "conversation_id",
                            "the group key for this conversation is not available yet",
                        )
                    }
                })?;
            return Ok((key, Some(version)));
        }

        let peer = conversation
            .direct_peer(user_id)
            .ok_or(ChatError::NotFound("conversation peer"))?;
        let peer_key = self.keys.get_user_public_key(peer).await?.ok_or_else(|| {
            ChatError::validation(
                "recipient",
                "the recipient has not set up encrypted messaging yet",
            )
        })?;
        Ok((derive_shared_secret(pair.private_key(), &peer_key)?, None))
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendOutcome, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let pair = self.keys.require_current_keys()?;
        let content = self.validate_content(&request.content)?;

        let conversation = self.load_conversation(request.conversation_id).await?;
        self.require_participant(user.id, &conversation).await?;
        let (key, key_version) = self.outgoing_key(user.id, &pair, &conversation).await?;
        let payload = encrypt_message(content, &key)?;

        let queued = QueuedMessage {
            conversation_id: conversation.id,
            sender_id: user.id,
            encrypted_content: payload.ciphertext,
            initialization_vector: payload.iv,
            key_version,
            created_at: Utc::now(),
        };

        if !self.connectivity.is_online() {
            let item = self.queue.enqueue(&queued)?;
            tracing::info!(conversation_id = %conversation.id, item_id = %item, "offline, message queued");
            return Ok(SendOutcome::Queued(item));
        }

        let new_message = NewMessage {
            conversation_id: queued.conversation_id,
            sender_id: queued.sender_id,
            encrypted_content: queued.encrypted_content.clone(),
            initialization_vector: queued.initialization_vector.clone(),
            sequence_number: 0,
            key_version,
            created_at: queued.created_at,
        };
        match persist_message(&self.repos, new_message).await {
            Ok(message) => Ok(SendOutcome::Sent(message)),
            Err(ChatError::Connection(reason)) => {
                let item = self.queue.enqueue(&queued)?;
                tracing::warn!(
                    conversation_id = %conversation.id,
                    item_id = %item,
                    error = %reason,
                    "send failed, message queued for retry"
                );
                Ok(SendOutcome::Queued(item))
            }
            Err(e) => Err(e),
        }
    }

    /// One page of history, newest first, strictly older than `cursor`.
    /// Undecryptable messages come back as placeholders.
    pub async fn get_message_history(
        &self,
        conversation_id: ConversationId,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> Result<MessagePage, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_participant(user.id, &conversation).await?;

        let limit = limit
            .unwrap_or(self.policy.history_page_size)
            .clamp(1, MAX_HISTORY_PAGE_SIZE);
        let mut rows = self
            .repos
            .messages
            .list_page(conversation_id, cursor, limit + 1)
            .await?;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let mut messages = Vec::with_capacity(rows.len());
        match self.keys.get_current_keys() {
            None => {
                for row in &rows {
                    messages.push(to_decrypted(row, KEYS_UNAVAILABLE_PLACEHOLDER.to_string(), false));
                }
            }
            Some(pair) => {
                let mut decryptor =
                    MessageDecryptor::new(&self.keys, &self.group_keys, user.id, pair);
                for row in &rows {
                    match decryptor.decrypt(&conversation, row).await {
                        Ok(content) => messages.push(to_decrypted(row, content, true)),
                        Err(e) => {
                            tracing::warn!(message_id = %row.id, error = %e, "message could not be decrypted");
                            messages.push(to_decrypted(
                                row,
                                UNDECRYPTABLE_PLACEHOLDER.to_string(),
                                false,
                            ));
                        }
                    }
                }
            }
        }

        let next_cursor = if has_more {
            rows.last().map(|m| m.sequence_number)
        } else {
            None
        };
        Ok(MessagePage {
            messages,
            next_cursor,
            has_more,
        })
    }

    /// Sender-only, within the edit window, while still a participant.
    /// Re-encrypts under the conversation's current key.
    pub async fn edit_message(
        &self,
        request: EditMessageRequest,
    ) -> Result<DecryptedMessage, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let pair = self.keys.require_current_keys()?;
        let content = self.validate_content(&request.new_content)?;

        let message = self
            .repos
            .messages
            .get(request.message_id)
            .await?
            .filter(|m| !m.deleted)
            .ok_or(ChatError::NotFound("message"))?;
        if message.sender_id != user.id {
            return Err(ChatError::validation(
                "message_id",
                "you can only edit your own messages",
            ));
        }
        if Utc::now() - message.created_at > self.policy.edit_window() {
            return Err(ChatError::validation(
                "message_id",
                "the edit window for this message has passed",
            ));
        }

        let conversation = self.load_conversation(message.conversation_id).await?;
        self.require_participant(user.id, &conversation).await?;
        let (key, key_version) = self.outgoing_key(user.id, &pair, &conversation).await?;
        let payload = encrypt_message(content, &key)?;
        let updated = self
            .repos
            .messages
            .update_content(
                message.id,
                payload.ciphertext,
                payload.iv,
                key_version,
                Utc::now(),
            )
            .await?;
        tracing::debug!(message_id = %updated.id, "message edited");
        Ok(to_decrypted(&updated, content.to_string(), true))
    }

    /// Sender-only soft delete within the delete window, while still a
    /// participant. Sequence numbers are never reused.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let message = self
            .repos
            .messages
            .get(message_id)
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        if message.sender_id != user.id {
            return Err(ChatError::validation(
                "message_id",
                "you can only delete your own messages",
            ));
        }
        let conversation = self.load_conversation(message.conversation_id).await?;
        self.require_participant(user.id, &conversation).await?;
        if message.deleted {
            return Ok(());
        }
        if Utc::now() - message.created_at > self.policy.delete_window() {
            return Err(ChatError::validation(
                "message_id",
                "the delete window for this message has passed",
            ));
        }
        self.repos.messages.mark_deleted(message_id).await?;
        tracing::debug!(message_id = %message_id, "message deleted");
        Ok(())
    }

    /// Sets `read_at` on unread messages from others. Returns how many changed.
    pub async fn mark_as_read(&self, message_ids: &[MessageId]) -> Result<u64, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        if message_ids.is_empty() {
            return Ok(0);
        }
        self.repos
            .messages
            .mark_read(message_ids, user.id, Utc::now())
            .await
    }

    pub async fn get_or_create_direct_conversation(
        &self,
        peer: UserId,
    ) -> Result<Conversation, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        if peer == user.id {
            return Err(ChatError::validation(
                "peer_id",
                "you cannot start a conversation with yourself",
            ));
        }
        if let Some(existing) = self.repos.conversations.find_direct(user.id, peer).await? {
            return Ok(existing);
        }
        if !self.repos.connections.are_connected(user.id, peer).await? {
            return Err(ChatError::group(
                GroupErrorCode::NotConnected,
                format!("user {peer} is not a connection"),
            ));
        }
        if self.keys.get_user_public_key(peer).await?.is_none() {
            return Err(ChatError::group(
                GroupErrorCode::MissingPublicKey,
                format!("user {peer} has not published an encryption key"),
            ));
        }
        let conversation = self
            .repos
            .conversations
            .insert(Conversation::new_direct(user.id, peer))
            .await?;
        tracing::info!(conversation_id = %conversation.id, "direct conversation created");
        Ok(conversation)
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.repos.conversations.list_for_user(user.id).await
    }

    /// Drain queued messages if the device is online.
    pub async fn flush_queue(&self) -> Result<SyncResult, ChatError> {
        if !self.connectivity.is_online() {
            tracing::debug!("offline, queue drain skipped");
            return Ok(SyncResult::default());
        }
        self.queue.sync().await
    }
}
