//! Message adapter: queued ciphertext is written to the remote message store
//! once connectivity returns. Content is encrypted before it is queued, so the
//! local database never holds plaintext.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::{ConversationId, MessageId, UserId};
use ciphertalk_shared::model::NewMessage;
use serde::{Deserialize, Serialize};

use super::{OfflineQueue, QueueProcessor};
use crate::messages::persist_message;
use crate::store::Repositories;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub initialization_vector: String,
    pub key_version: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Recorded on the queue item after the remote write succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub sequence_number: i64,
}

pub struct MessageDelivery {
    repos: Repositories,
}

impl MessageDelivery {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }
}

#[async_trait]
impl QueueProcessor for MessageDelivery {
    const QUEUE_NAME: &'static str = "messages";

    type Payload = QueuedMessage;
    type Receipt = DeliveryReceipt;

    async fn process_item(&self, payload: &QueuedMessage) -> Result<DeliveryReceipt, ChatError> {
        let message = persist_message(
            &self.repos,
            NewMessage {
                conversation_id: payload.conversation_id,
                sender_id: payload.sender_id,
                encrypted_content: payload.encrypted_content.clone(),
                initialization_vector: payload.initialization_vector.clone(),
                sequence_number: 0,
                key_version: payload.key_version,
                created_at: payload.created_at,
            },
        )
        .await?;
        Ok(DeliveryReceipt {
            message_id: message.id,
            sequence_number: message.sequence_number,
        })
    }
}

pub type MessageQueue = OfflineQueue<MessageDelivery>;
