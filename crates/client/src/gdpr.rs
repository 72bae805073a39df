//! Data subject rights: full decrypted export and account erasure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ciphertalk_shared::constants::{KEYS_UNAVAILABLE_PLACEHOLDER, UNDECRYPTABLE_PLACEHOLDER};
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::{MessageId, UserId};
use ciphertalk_shared::model::{Connection, ConnectionStatus, Conversation, Message, Profile};
use serde::Serialize;

use crate::auth::{require_user, AuthProvider};
use crate::erasure::ErasureClient;
use crate::group_keys::GroupKeyService;
use crate::keys::KeyManagementService;
use crate::messages::MessageDecryptor;
use crate::queue::MessageQueue;
use crate::store::Repositories;

#[derive(Debug, Clone, Serialize)]
pub struct ExportedUser {
    pub id: UserId,
    pub email: String,
}

/// Connections grouped relative to the exporting user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassifiedConnections {
    pub accepted: Vec<Connection>,
    pub pending_sent: Vec<Connection>,
    pub pending_received: Vec<Connection>,
    pub blocked: Vec<Connection>,
}

impl ClassifiedConnections {
    fn classify(user_id: UserId, connections: Vec<Connection>) -> Self {
        let mut out = Self::default();
        for connection in connections {
            match connection.status {
                ConnectionStatus::Accepted => out.accepted.push(connection),
                ConnectionStatus::Blocked => out.blocked.push(connection),
                ConnectionStatus::Pending if connection.requester_id == user_id => {
                    out.pending_sent.push(connection)
                }
                ConnectionStatus::Pending => out.pending_received.push(connection),
            }
        }
        out
    }

    pub fn total(&self) -> usize {
        self.accepted.len() + self.pending_sent.len() + self.pending_received.len() + self.blocked.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub decrypted: bool,
    pub sequence_number: i64,
    pub edited: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedConversation {
    pub conversation: Conversation,
    pub participants: Vec<UserId>,
    pub messages: Vec<ExportedMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportStatistics {
    pub total_messages_sent: usize,
    pub total_messages_received: usize,
    pub total_conversations: usize,
    pub total_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDataExport {
    pub exported_at: DateTime<Utc>,
    pub user: ExportedUser,
    pub profile: Option<Profile>,
    pub connections: ClassifiedConnections,
    pub conversations: Vec<ExportedConversation>,
    pub statistics: ExportStatistics,
}

pub struct GdprService {
    repos: Repositories,
    auth: Arc<dyn AuthProvider>,
    keys: Arc<KeyManagementService>,
    group_keys: Arc<GroupKeyService>,
    queue: Arc<MessageQueue>,
    erasure: Arc<dyn ErasureClient>,
}

impl GdprService {
    pub fn new(
        repos: Repositories,
        auth: Arc<dyn AuthProvider>,
        keys: Arc<KeyManagementService>,
        group_keys: Arc<GroupKeyService>,
        queue: Arc<MessageQueue>,
        erasure: Arc<dyn ErasureClient>,
    ) -> Self {
        Self {
            repos,
            auth,
            keys,
            group_keys,
            queue,
            erasure,
        }
    }

    async fn participants(&self, conversation: &Conversation) -> Result<Vec<UserId>, ChatError> {
        if conversation.is_group {
            let members = self.repos.members.list_active(conversation.id).await?;
            Ok(members.into_iter().map(|m| m.user_id).collect())
        } else {
            Ok([conversation.participant_1_id, conversation.participant_2_id]
                .into_iter()
                .flatten()
                .collect())
        }
    }

    /// Everything stored about the signed-in user, with every message
    /// (soft-deleted included) decrypted where possible. Groups the user left
    /// are included up to the moment they left. Never aborts on a single bad
    /// message.
    pub async fn export_user_data(&self) -> Result<UserDataExport, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let profile = self.repos.profiles.get(user.id).await?;
        let connections = ClassifiedConnections::classify(
            user.id,
            self.repos.connections.list_for_user(user.id).await?,
        );
        let conversations = self.repos.conversations.list_involving(user.id).await?;

        let pair = self.keys.get_current_keys();
        if pair.is_none() {
            tracing::warn!(user_id = %user.id, "exporting without a key pair, message content will be withheld");
        }
        let mut decryptor = pair
            .map(|pair| MessageDecryptor::new(&self.keys, &self.group_keys, user.id, pair));

        let mut statistics = ExportStatistics {
            total_conversations: conversations.len(),
            total_connections: connections.total(),
            ..Default::default()
        };
        let mut exported = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let participants = self.participants(&conversation).await?;
            let mut rows = self.repos.messages.list_all(conversation.id).await?;
            // A group the user left only contributes what was written while they belonged.
            if conversation.is_group {
                let left_at = self
                    .repos
                    .members
                    .get(conversation.id, user.id)
                    .await?
                    .and_then(|m| m.left_at);
                if let Some(left_at) = left_at {
                    rows.retain(|m| m.created_at <= left_at);
                }
            }
            let mut messages = Vec::with_capacity(rows.len());
            for row in &rows {
                if row.sender_id == user.id {
                    statistics.total_messages_sent += 1;
                } else {
                    statistics.total_messages_received += 1;
                }
                let (content, decrypted) = match decryptor.as_mut() {
                    None => (KEYS_UNAVAILABLE_PLACEHOLDER.to_string(), false),
                    Some(d) => match d.decrypt(&conversation, row).await {
                        Ok(content) => (content, true),
                        Err(e) => {
                            tracing::warn!(message_id = %row.id, error = %e, "export could not decrypt message");
                            (UNDECRYPTABLE_PLACEHOLDER.to_string(), false)
                        }
                    },
                };
                messages.push(exported_message(row, content, decrypted));
            }
            exported.push(ExportedConversation {
                conversation,
                participants,
                messages,
            });
        }

        tracing::info!(
            user_id = %user.id,
            conversations = statistics.total_conversations,
            messages = statistics.total_messages_sent + statistics.total_messages_received,
            "user data exported"
        );
        Ok(UserDataExport {
            exported_at: Utc::now(),
            user: ExportedUser {
                id: user.id,
                email: user.email,
            },
            profile,
            connections,
            conversations: exported,
            statistics,
        })
    }

    pub async fn export_json(&self) -> Result<String, ChatError> {
        let export = self.export_user_data().await?;
        serde_json::to_string_pretty(&export)
            .map_err(|e| ChatError::Storage(format!("failed to serialize export: {e}")))
    }

    /// Purge local ciphertext, ask the server to cascade-delete the account,
    /// then end the session. Local purging happens before the remote call so a
    /// failed erasure leaves nothing behind on this device.
    pub async fn delete_user_account(&self) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let session = self.auth.session().await.ok_or(ChatError::Authentication)?;

        match self.queue.purge(|queued| queued.sender_id == user.id) {
            Ok(removed) => tracing::debug!(user_id = %user.id, removed, "queued messages purged"),
            Err(e) => tracing::warn!(user_id = %user.id, error = %e, "failed to purge queued messages"),
        }
        self.group_keys.clear();

        if let Err(e) = self.erasure.erase_account(&session.access_token).await {
            tracing::warn!(user_id = %user.id, error = %e, "remote account erasure failed");
            return Err(e);
        }

        self.keys.clear_keys();
        self.auth.sign_out().await?;
        tracing::info!(user_id = %user.id, "account erased");
        Ok(())
    }
}

fn exported_message(message: &Message, content: String, decrypted: bool) -> ExportedMessage {
    ExportedMessage {
        id: message.id,
        sender_id: message.sender_id,
        content,
        decrypted,
        sequence_number: message.sequence_number,
        edited: message.edited,
        deleted: message.deleted,
        created_at: message.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(requester: UserId, recipient: UserId, status: ConnectionStatus) -> Connection {
        Connection {
            requester_id: requester,
            recipient_id: recipient,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pending_connections_split_by_direction() {
        let me = UserId::new();
        let other = UserId::new();
        let classified = ClassifiedConnections::classify(
            me,
            vec![
                connection(me, other, ConnectionStatus::Pending),
                connection(other, me, ConnectionStatus::Pending),
                connection(me, UserId::new(), ConnectionStatus::Accepted),
                connection(UserId::new(), me, ConnectionStatus::Blocked),
            ],
        );
        assert_eq!(classified.pending_sent.len(), 1);
        assert_eq!(classified.pending_received.len(), 1);
        assert_eq!(classified.accepted.len(), 1);
        assert_eq!(classified.blocked.len(), 1);
        assert_eq!(classified.total(), 4);
    }
}
