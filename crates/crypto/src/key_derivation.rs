//! Password-derived key pairs.
//!
//! A user's X25519 key pair is never stored. It is re-derived each session by
//! running Argon2id over the password and a per-user random salt, and using the
//! 32-byte output as the X25519 static secret. Only the public key (as a
//! JWK-style JSON string) and the salt are ever persisted.

use base64::Engine;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        use ciphertalk_shared::constants::*;
        Self {
            memory_kib: DEFAULT_KDF_MEMORY_KIB,
            iterations: DEFAULT_KDF_ITERATIONS,
            parallelism: DEFAULT_KDF_PARALLELISM,
        }
    }
}

/// Exportable public key in JWK form: `{"kty":"OKP","crv":"X25519","x":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    /// Base64url (unpadded) encoding of the 32-byte public key.
    pub x: String,
}

impl PublicKeyJwk {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            kty: "OKP".into(),
            crv: "X25519".into(),
            x: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key.as_bytes()),
        }
    }

    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        if self.kty != "OKP" || self.crv != "X25519" {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&self.x)?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(PublicKey::from(bytes))
    }

    /// The serialized form stored in `UserEncryptionKeyRecord.public_key`.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Parse a stored public key string straight into a usable X25519 key.
pub fn parse_public_key(json: &str) -> Result<PublicKey, CryptoError> {
    PublicKeyJwk::from_json(json)?.to_public_key()
}

/// The session's key pair. Held in memory only; the secret is wiped on drop.
pub struct DerivedKeyPair {
    private_key: StaticSecret,
    public_key: PublicKey,
    public_key_jwk: PublicKeyJwk,
    salt: Vec<u8>,
}

impl std::fmt::Debug for DerivedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeyPair")
            .field("public_key_jwk", &self.public_key_jwk)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl DerivedKeyPair {
    pub fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_jwk(&self) -> &PublicKeyJwk {
        &self.public_key_jwk
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Base64 salt as persisted in the key record.
    pub fn salt_b64(&self) -> String {
        encode_salt(&self.salt)
    }

    /// Whether this pair's public key equals the stored JWK string.
    pub fn matches_stored(&self, stored_public_key: &str) -> Result<bool, CryptoError> {
        let stored = parse_public_key(stored_public_key)?;
        Ok(stored.as_bytes() == self.public_key.as_bytes())
    }
}

/// Generate a random 16-byte salt for password derivation.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);
    salt
}

pub fn encode_salt(salt: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(salt)
}

pub fn decode_salt(salt_b64: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(salt_b64)
        .map_err(|e| CryptoError::InvalidSalt(e.to_string()))
}

/// Derive the X25519 key pair for `(password, salt)`. Deterministic: the same
/// inputs always produce the same public key.
pub fn derive_key_pair(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<DerivedKeyPair, CryptoError> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::InvalidSalt("salt too short".into()));
    }

    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );

    let mut seed = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, seed.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let private_key = StaticSecret::from(*seed);
    let public_key = PublicKey::from(&private_key);
    let public_key_jwk = PublicKeyJwk::from_public_key(&public_key);

    Ok(DerivedKeyPair {
        private_key,
        public_key,
        public_key_jwk,
        salt: salt.to_vec(),
    })
}
