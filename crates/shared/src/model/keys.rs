use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{KeyRecordId, UserId};

/// A user's published encryption key. Only the public half and the salt are
/// ever persisted; the private key is re-derived from the password each session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEncryptionKeyRecord {
    pub id: KeyRecordId,
    pub user_id: UserId,
    /// Serialized public key (JWK-style JSON).
    pub public_key: String,
    /// Base64 salt. `None` marks a legacy random-key record.
    pub encryption_salt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl UserEncryptionKeyRecord {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn is_legacy(&self) -> bool {
        self.encryption_salt.is_none()
    }
}

/// Insert payload for a key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKeyRecord {
    pub user_id: UserId,
    pub public_key: String,
    pub encryption_salt: Option<String>,
}
