//! Default policy values, each overridable through the client configuration,
//! and the hard limits that bound those overrides.

/// Maximum delivery attempts for an offline queue item before it is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Backoff delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 1000;
/// Factor applied to the backoff delay for every further retry.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Largest `max_retries` a queue configuration may ask for.
pub const MAX_QUEUE_RETRIES: u32 = 50;
/// Ceiling on the backoff between two delivery attempts: 1 hour.
pub const MAX_RETRY_DELAY_MS: u64 = 60 * 60 * 1000;

/// Maximum number of members in a group, owner included.
pub const DEFAULT_MAX_GROUP_MEMBERS: usize = 50;
/// Maximum length for group names, in characters.
pub const DEFAULT_MAX_GROUP_NAME_LENGTH: usize = 100;

/// Maximum length of a message body, in characters, after trimming.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 10_000;
/// How long after sending a message its author may still edit it: 15 minutes.
pub const DEFAULT_EDIT_WINDOW_SECS: u64 = 15 * 60;
/// How long after sending a message its author may still delete it: 1 hour.
pub const DEFAULT_DELETE_WINDOW_SECS: u64 = 60 * 60;
/// Default page size for message history.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;
/// Upper bound accepted for a caller-supplied history page size.
pub const MAX_HISTORY_PAGE_SIZE: usize = 100;

/// Argon2id memory cost in KiB.
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 65536;
/// Argon2id iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;
/// Argon2id lane count.
pub const DEFAULT_KDF_PARALLELISM: u32 = 4;

/// Shown in place of a message whose ciphertext cannot be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[Message could not be decrypted]";
/// Shown in place of message content when the session holds no key pair.
pub const KEYS_UNAVAILABLE_PLACEHOLDER: &str =
    "[Encryption keys unavailable - unlock messaging with your password to decrypt]";
