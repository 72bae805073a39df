//! Group key generation, per-member distribution and the session cache of
//! unwrapped group keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use ciphertalk_crypto::group_key::{self, derive_wrapping_key, unwrap_group_key, wrap_group_key};
use ciphertalk_crypto::{CryptoError, DerivedKeyPair, SymmetricKey};
use ciphertalk_shared::error::{ChatError, GroupErrorCode};
use ciphertalk_shared::ids::{ConversationId, UserId};
use ciphertalk_shared::model::GroupKeyRecord;
use futures::future::join_all;
use zeroize::Zeroizing;

use crate::auth::{require_user, AuthProvider};
use crate::keys::KeyManagementService;
use crate::store::GroupKeyRepository;

/// Which members received their wrapped copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionOutcome {
    pub successful: Vec<UserId>,
    pub pending: Vec<UserId>,
}

type CacheKey = (ConversationId, i32);

pub struct GroupKeyService {
    keys: Arc<KeyManagementService>,
    auth: Arc<dyn AuthProvider>,
    group_keys: Arc<dyn GroupKeyRepository>,
    cache: Mutex<HashMap<CacheKey, SymmetricKey>>,
}

impl GroupKeyService {
    pub fn new(
        keys: Arc<KeyManagementService>,
        auth: Arc<dyn AuthProvider>,
        group_keys: Arc<dyn GroupKeyRepository>,
    ) -> Self {
        Self {
            keys,
            auth,
            group_keys,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<CacheKey, SymmetricKey>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn generate_group_key(&self) -> SymmetricKey {
        group_key::generate_group_key()
    }

    pub fn export_key_bytes(&self, key: &SymmetricKey) -> Zeroizing<Vec<u8>> {
        group_key::export_key_bytes(key)
    }

    pub fn import_key_bytes(&self, bytes: &[u8]) -> Result<SymmetricKey, ChatError> {
        Ok(group_key::import_key_bytes(bytes)?)
    }

    /// Wrap `key` for every member and persist one record per member.
    ///
    /// Per-member failures land in `pending`. Fails only when there were
    /// members and none of them received the key. The key is cached for this
    /// session on any success.
    pub async fn distribute_group_key(
        &self,
        conversation_id: ConversationId,
        key: &SymmetricKey,
        members: &[UserId],
        key_version: i32,
    ) -> Result<DistributionOutcome, ChatError> {
        let distributor = require_user(self.auth.as_ref()).await?.id;
        let pair = self.keys.require_current_keys()?;

        let attempts = members.iter().map(|&member| {
            let pair = pair.clone();
            async move {
                let result = self
                    .deliver(conversation_id, key, member, key_version, distributor, &pair)
                    .await;
                (member, result)
            }
        });

        let mut outcome = DistributionOutcome::default();
        for (member, result) in join_all(attempts).await {
            match result {
                Ok(()) => outcome.successful.push(member),
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        member_id = %member,
                        key_version,
                        error = %e,
                        "group key delivery failed, member left pending"
                    );
                    outcome.pending.push(member);
                }
            }
        }

        if !members.is_empty() && outcome.successful.is_empty() {
            return Err(ChatError::group(
                GroupErrorCode::KeyDistributionFailed,
                "group key could not be delivered to any member",
            ));
        }

        self.cache_group_key(conversation_id, key_version, key.clone());
        tracing::debug!(
            conversation_id = %conversation_id,
            key_version,
            delivered = outcome.successful.len(),
            pending = outcome.pending.len(),
            "group key distributed"
        );
        Ok(outcome)
    }

    async fn deliver(
        &self,
        conversation_id: ConversationId,
        key: &SymmetricKey,
        member: UserId,
        key_version: i32,
        distributor: UserId,
        pair: &DerivedKeyPair,
    ) -> Result<(), ChatError> {
        let member_key = if member == distributor {
            *pair.public_key()
        } else {
            self.keys.get_user_public_key(member).await?.ok_or_else(|| {
                ChatError::group(
                    GroupErrorCode::MissingPublicKey,
                    format!("user {member} has not published an encryption key"),
                )
            })?
        };
        let wrapping = derive_wrapping_key(pair.private_key(), &member_key)?;
        let wrapped = wrap_group_key(key, &wrapping)?;
        self.group_keys
            .insert(GroupKeyRecord {
                conversation_id,
                key_version,
                member_user_id: member,
                distributed_by: distributor,
                encrypted_key: wrapped.ciphertext,
                iv: wrapped.iv,
                created_at: Utc::now(),
            })
            .await
    }

    /// The group key for `(conversation, version)`, unwrapping this user's
    /// record on a cache miss.
    pub async fn get_group_key(
        &self,
        conversation_id: ConversationId,
        key_version: i32,
    ) -> Result<SymmetricKey, ChatError> {
        let cached = self.lock_cache().get(&(conversation_id, key_version)).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        let user = require_user(self.auth.as_ref()).await?;
        let pair = self.keys.require_current_keys()?;
        let record = self
            .group_keys
            .get(conversation_id, key_version, user.id)
            .await?
            .ok_or(ChatError::NotFound("group key"))?;

        let distributor_key = if record.distributed_by == user.id {
            *pair.public_key()
        } else {
            self.keys
                .get_user_public_key(record.distributed_by)
                .await?
                .ok_or_else(|| {
                    ChatError::group(
                        GroupErrorCode::MissingPublicKey,
                        "group key distributor no longer has a published key",
                    )
                })?
        };
        let wrapping = derive_wrapping_key(pair.private_key(), &distributor_key)?;
        let key = unwrap_group_key(&record.encrypted_key, &record.iv, &wrapping)
            .map_err(|e: CryptoError| ChatError::Crypto(format!("cannot unwrap group key: {e}")))?;

        self.cache_group_key(conversation_id, key_version, key.clone());
        Ok(key)
    }

    pub fn cache_group_key(&self, conversation_id: ConversationId, key_version: i32, key: SymmetricKey) {
        self.lock_cache().insert((conversation_id, key_version), key);
    }

    /// Drop every cached version of one conversation's key.
    pub fn evict_conversation(&self, conversation_id: ConversationId) {
        self.lock_cache().retain(|(conv, _), _| *conv != conversation_id);
    }

    pub fn clear(&self) {
        self.lock_cache().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.lock_cache().len()
    }
}
