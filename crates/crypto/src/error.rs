//! Error types for the ciphertalk-crypto crate.

use ciphertalk_shared::error::ChatError;
use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The salt is missing, malformed or too short.
    #[error("invalid salt: {0}")]
    InvalidSalt(String),

    /// Argon2 rejected its parameters or input.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AES-GCM encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (wrong key, tampered ciphertext, etc.).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Base64 or JSON encoding error.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}

impl From<CryptoError> for ChatError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyDerivation(msg) | CryptoError::InvalidSalt(msg) => {
                ChatError::KeyDerivation(msg)
            }
            other => ChatError::Crypto(other.to_string()),
        }
    }
}
