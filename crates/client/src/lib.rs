//! ciphertalk-client: end-to-end encrypted messaging services.
//!
//! Password-derived key management, group key distribution, the group
//! membership state machine, encrypted messaging with an offline send queue,
//! and GDPR export/erasure. Persistence, identity and connectivity are
//! injected through the traits in [`store`], [`auth`] and [`connectivity`].

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod erasure;
pub mod gdpr;
pub mod group_keys;
pub mod groups;
pub mod keys;
pub mod messages;
pub mod queue;
pub mod store;

use std::sync::Arc;

use ciphertalk_shared::error::ChatError;

use crate::auth::AuthProvider;
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::erasure::ErasureClient;
use crate::gdpr::GdprService;
use crate::group_keys::GroupKeyService;
use crate::groups::GroupService;
use crate::keys::KeyManagementService;
use crate::messages::MessageService;
use crate::queue::{MessageDelivery, MessageQueue, QueueDb};
use crate::store::Repositories;

/// Every service for one signed-in session, wired against shared collaborators.
pub struct ChatClient {
    pub keys: Arc<KeyManagementService>,
    pub group_keys: Arc<GroupKeyService>,
    pub groups: GroupService,
    pub messages: MessageService,
    pub gdpr: GdprService,
    auth: Arc<dyn AuthProvider>,
}

impl ChatClient {
    pub fn new(
        repos: Repositories,
        auth: Arc<dyn AuthProvider>,
        connectivity: Arc<dyn Connectivity>,
        erasure: Arc<dyn ErasureClient>,
        queue_db: QueueDb,
        config: &ClientConfig,
    ) -> Self {
        let keys = Arc::new(KeyManagementService::new(
            repos.keys.clone(),
            auth.clone(),
            config.kdf_params(),
        ));
        let group_keys = Arc::new(GroupKeyService::new(
            keys.clone(),
            auth.clone(),
            repos.group_keys.clone(),
        ));
        let queue: Arc<MessageQueue> = Arc::new(MessageQueue::new(
            queue_db,
            MessageDelivery::new(repos.clone()),
            config.queue.clone(),
        ));

        let groups = GroupService::new(
            repos.clone(),
            auth.clone(),
            keys.clone(),
            group_keys.clone(),
            config.groups.clone(),
        );
        let messages = MessageService::new(
            repos.clone(),
            auth.clone(),
            keys.clone(),
            group_keys.clone(),
            queue.clone(),
            connectivity,
            config.messages.clone(),
        );
        let gdpr = GdprService::new(
            repos,
            auth.clone(),
            keys.clone(),
            group_keys.clone(),
            queue,
            erasure,
        );

        Self {
            keys,
            group_keys,
            groups,
            messages,
            gdpr,
            auth,
        }
    }

    /// Drop session key material, then end the auth session.
    pub async fn sign_out(&self) -> Result<(), ChatError> {
        self.keys.clear_keys();
        self.group_keys.clear();
        self.auth.sign_out().await?;
        tracing::info!("signed out");
        Ok(())
    }
}
