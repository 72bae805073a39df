//! ciphertalk-crypto: password-derived X25519 key pairs, ECDH shared secrets,
//! AES-256-GCM message encryption and group key wrapping.

pub mod encryption;
pub mod error;
pub mod group_key;
pub mod key_derivation;

pub use encryption::{
    decrypt_message, derive_shared_secret, encrypt_message, EncryptedPayload, SymmetricKey,
};
pub use error::CryptoError;
pub use x25519_dalek::{PublicKey, StaticSecret};

pub use key_derivation::{
    derive_key_pair, generate_salt, parse_public_key, DerivedKeyPair, KdfParams, PublicKeyJwk,
};
