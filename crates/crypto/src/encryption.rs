//! Shared-secret derivation and AES-256-GCM message encryption.
//!
//! Two parties derive the same conversation key independently: X25519 between
//! one's private key and the other's public key, expanded with HKDF-SHA256.
//! Every encryption draws a fresh 96-bit IV; ciphertext and IV travel as base64.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

const NONCE_SIZE: usize = 12; // 96-bit nonce for AES-256-GCM
const KEY_SIZE: usize = 32; // 256-bit key
const CONVERSATION_KEY_INFO: &[u8] = b"ciphertalk-conversation-key-v1";

/// A 32-byte AES-256 key that is securely zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    pub(crate) key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Ciphertext and IV, both base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
}

/// Derive the symmetric key shared with the owner of `peer_public_key`.
///
/// Rejects low-order peer keys whose agreement output is all zeros.
pub fn derive_shared_secret(
    private_key: &StaticSecret,
    peer_public_key: &PublicKey,
) -> Result<SymmetricKey, CryptoError> {
    agree_and_expand(private_key, peer_public_key, CONVERSATION_KEY_INFO)
}

/// X25519 agreement expanded with HKDF-SHA256 under `info`.
pub(crate) fn agree_and_expand(
    private_key: &StaticSecret,
    peer_public_key: &PublicKey,
    info: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let shared = private_key.diffie_hellman(peer_public_key);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "peer public key produced a non-contributory secret".into(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let key = SymmetricKey { key: okm };
    okm.zeroize();
    Ok(key)
}

/// Encrypt a UTF-8 message under `key`.
pub fn encrypt_message(plaintext: &str, key: &SymmetricKey) -> Result<EncryptedPayload, CryptoError> {
    encrypt_bytes(plaintext.as_bytes(), key)
}

/// Decrypt a message produced by [`encrypt_message`]. Fails on a wrong key or
/// any tampering with ciphertext or IV.
pub fn decrypt_message(
    ciphertext_b64: &str,
    iv_b64: &str,
    key: &SymmetricKey,
) -> Result<String, CryptoError> {
    let plaintext = decrypt_bytes(ciphertext_b64, iv_b64, key)?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not valid UTF-8".into()))
}

pub(crate) fn encrypt_bytes(
    plaintext: &[u8],
    key: &SymmetricKey,
) -> Result<EncryptedPayload, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key.key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(EncryptedPayload {
        ciphertext: b64.encode(ciphertext),
        iv: b64.encode(nonce_bytes),
    })
}

pub(crate) fn decrypt_bytes(
    ciphertext_b64: &str,
    iv_b64: &str,
    key: &SymmetricKey,
) -> Result<Vec<u8>, CryptoError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let nonce_bytes = b64.decode(iv_b64)?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed(format!(
            "iv must be {NONCE_SIZE} bytes, got {}",
            nonce_bytes.len()
        )));
    }
    let ciphertext = b64.decode(ciphertext_b64)?;

    let cipher = Aes256Gcm::new_from_slice(&key.key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
