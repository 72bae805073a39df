//! Group keys: one random AES-256-GCM key per group and key version, wrapped
//! individually for every member under a key agreed between the distributor
//! and that member. The wrapping key is expanded with its own HKDF info, so it
//! never equals the key protecting the same pair's direct messages.

use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encryption::{
    agree_and_expand, decrypt_bytes, encrypt_bytes, EncryptedPayload, SymmetricKey,
};
use crate::error::CryptoError;

const GROUP_KEY_WRAP_INFO: &[u8] = b"ciphertalk-group-key-wrap-v1";

/// Generate a fresh, independent group key.
pub fn generate_group_key() -> SymmetricKey {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(bytes.as_mut());
    SymmetricKey::from_bytes(*bytes)
}

/// Raw key bytes for wrapping. The returned buffer is zeroed on drop.
pub fn export_key_bytes(key: &SymmetricKey) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(key.as_bytes().to_vec())
}

/// Rebuild a key from bytes produced by [`export_key_bytes`].
pub fn import_key_bytes(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("group key must be 32 bytes, got {}", bytes.len())))?;
    Ok(SymmetricKey::from_bytes(array))
}

/// Key used to wrap group keys between `private_key`'s owner and the owner of
/// `peer_public_key`. Both sides derive the same value.
pub fn derive_wrapping_key(
    private_key: &StaticSecret,
    peer_public_key: &PublicKey,
) -> Result<SymmetricKey, CryptoError> {
    agree_and_expand(private_key, peer_public_key, GROUP_KEY_WRAP_INFO)
}

/// Encrypt `group_key` for one member under their `wrapping_key`.
pub fn wrap_group_key(
    group_key: &SymmetricKey,
    wrapping_key: &SymmetricKey,
) -> Result<EncryptedPayload, CryptoError> {
    let raw = export_key_bytes(group_key);
    encrypt_bytes(&raw, wrapping_key)
}

/// Recover a group key wrapped by [`wrap_group_key`].
pub fn unwrap_group_key(
    encrypted_key_b64: &str,
    iv_b64: &str,
    wrapping_key: &SymmetricKey,
) -> Result<SymmetricKey, CryptoError> {
    let raw = Zeroizing::new(decrypt_bytes(encrypted_key_b64, iv_b64, wrapping_key)?);
    import_key_bytes(&raw)
}
