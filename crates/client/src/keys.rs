//! Session key management.
//!
//! The private key never leaves memory: it is re-derived from the password and
//! the stored salt every session, and verified by comparing the derived public
//! key against the published one.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ciphertalk_crypto::key_derivation::decode_salt;
use ciphertalk_crypto::{derive_key_pair, generate_salt, parse_public_key};
use ciphertalk_crypto::{DerivedKeyPair, KdfParams, PublicKey};
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::UserId;
use ciphertalk_shared::model::NewKeyRecord;
use zeroize::Zeroizing;

use crate::auth::{require_user, AuthProvider};
use crate::store::KeyRepository;

type KeySlot = Option<Arc<DerivedKeyPair>>;

pub struct KeyManagementService {
    keys: Arc<dyn KeyRepository>,
    auth: Arc<dyn AuthProvider>,
    kdf: KdfParams,
    slot: RwLock<KeySlot>,
    /// Serializes initialize/derive so two derivations never race for the slot.
    op_lock: tokio::sync::Mutex<()>,
}

impl KeyManagementService {
    pub fn new(keys: Arc<dyn KeyRepository>, auth: Arc<dyn AuthProvider>, kdf: KdfParams) -> Self {
        Self {
            keys,
            auth,
            kdf,
            slot: RwLock::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, KeySlot> {
        self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, KeySlot> {
        self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run Argon2 off the async executor.
    async fn derive(&self, password: &str, salt: Vec<u8>) -> Result<DerivedKeyPair, ChatError> {
        let password = Zeroizing::new(password.to_owned());
        let params = self.kdf;
        let pair = tokio::task::spawn_blocking(move || derive_key_pair(&password, &salt, &params))
            .await
            .map_err(|e| ChatError::KeyDerivation(format!("derivation task failed: {e}")))??;
        Ok(pair)
    }

    /// Create and publish the user's first password-derived key pair.
    pub async fn initialize_keys(&self, password: &str) -> Result<Arc<DerivedKeyPair>, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let _op = self.op_lock.lock().await;

        if self.keys.find_active(user.id).await?.is_some() {
            return Err(ChatError::validation(
                "encryption_key",
                "encryption keys are already initialized; revoke them before re-initializing",
            ));
        }

        let salt = generate_salt();
        let pair = self.derive(password, salt.to_vec()).await?;
        self.keys
            .insert(NewKeyRecord {
                user_id: user.id,
                public_key: pair.public_key_jwk().to_json()?,
                encryption_salt: Some(pair.salt_b64()),
            })
            .await?;

        let pair = Arc::new(pair);
        *self.write_slot() = Some(pair.clone());
        tracing::info!(user_id = %user.id, "encryption keys initialized");
        Ok(pair)
    }

    /// Re-derive the session key pair and verify it against the published key.
    pub async fn derive_keys(&self, password: &str) -> Result<Arc<DerivedKeyPair>, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let _op = self.op_lock.lock().await;

        let record = self.keys.find_active(user.id).await?.ok_or_else(|| {
            ChatError::KeyDerivation("no encryption key record for this user".into())
        })?;
        let salt_b64 = record.encryption_salt.as_deref().ok_or_else(|| {
            ChatError::KeyDerivation(
                "stored key predates password-derived keys and must be migrated".into(),
            )
        })?;
        let salt = decode_salt(salt_b64)?;

        let pair = self.derive(password, salt).await?;
        if !pair.matches_stored(&record.public_key)? {
            tracing::warn!(user_id = %user.id, "derived public key does not match stored key");
            return Err(ChatError::KeyMismatch);
        }

        let pair = Arc::new(pair);
        *self.write_slot() = Some(pair.clone());
        tracing::info!(user_id = %user.id, "encryption keys unlocked");
        Ok(pair)
    }

    /// The session pair, if unlocked. Never touches storage.
    pub fn get_current_keys(&self) -> Option<Arc<DerivedKeyPair>> {
        self.read_slot().clone()
    }

    pub fn require_current_keys(&self) -> Result<Arc<DerivedKeyPair>, ChatError> {
        self.get_current_keys().ok_or(ChatError::EncryptionLocked)
    }

    pub fn clear_keys(&self) {
        if self.write_slot().take().is_some() {
            tracing::debug!("session key pair cleared");
        }
    }

    /// Revoke the published key remotely, then drop the session pair.
    pub async fn revoke_keys(&self) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let revoked = self.keys.revoke(user.id).await.map_err(|e| match e {
            ChatError::Connection(_) => e,
            other => ChatError::Connection(other.to_string()),
        })?;
        self.clear_keys();
        tracing::info!(user_id = %user.id, revoked, "encryption keys revoked");
        Ok(())
    }

    /// The peer's published public key, or `None` if they have not set up
    /// messaging yet.
    pub async fn get_user_public_key(&self, peer: UserId) -> Result<Option<PublicKey>, ChatError> {
        let Some(record) = self.keys.find_active(peer).await? else {
            return Ok(None);
        };
        match parse_public_key(&record.public_key) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                tracing::warn!(peer_id = %peer, error = %e, "peer has an unreadable public key");
                Ok(None)
            }
        }
    }

    /// True when the user only has legacy unsalted key records.
    pub async fn needs_migration(&self) -> Result<bool, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        if self.keys.has_salted_key(user.id).await? {
            return Ok(false);
        }
        self.keys.has_any_key(user.id).await
    }
}
