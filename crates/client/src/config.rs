use std::time::Duration;

use ciphertalk_crypto::KdfParams;
use ciphertalk_shared::constants::*;
use serde::Deserialize;

/// Client configuration loaded from a TOML file with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path of the local SQLite database holding offline queues.
    #[serde(default = "default_queue_db_path")]
    pub queue_db_path: String,
    /// Privileged account-erasure endpoint.
    #[serde(default = "default_erasure_url")]
    pub erasure_url: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub groups: GroupPolicy,
    #[serde(default)]
    pub messages: MessagePolicy,
    #[serde(default)]
    pub kdf: KdfConfig,
}

/// Retry policy for offline queues.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupPolicy {
    /// Owner included.
    #[serde(default = "default_max_group_members")]
    pub max_members: usize,
    #[serde(default = "default_max_group_name_length")]
    pub max_name_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePolicy {
    #[serde(default = "default_max_message_length")]
    pub max_length: usize,
    #[serde(default = "default_edit_window_secs")]
    pub edit_window_secs: u64,
    #[serde(default = "default_delete_window_secs")]
    pub delete_window_secs: u64,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

/// Argon2id cost used to derive key pairs from passwords.
#[derive(Debug, Clone, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_kdf_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_kdf_iterations")]
    pub iterations: u32,
    #[serde(default = "default_kdf_parallelism")]
    pub parallelism: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_queue_db_path() -> String {
    "ciphertalk-queue.db".to_string()
}
fn default_erasure_url() -> String {
    "http://localhost:54321/functions/v1/delete-account".to_string()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_RETRY_DELAY_MS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_max_group_members() -> usize {
    DEFAULT_MAX_GROUP_MEMBERS
}
fn default_max_group_name_length() -> usize {
    DEFAULT_MAX_GROUP_NAME_LENGTH
}
fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}
fn default_edit_window_secs() -> u64 {
    DEFAULT_EDIT_WINDOW_SECS
}
fn default_delete_window_secs() -> u64 {
    DEFAULT_DELETE_WINDOW_SECS
}
fn default_history_page_size() -> usize {
    DEFAULT_HISTORY_PAGE_SIZE
}
fn default_kdf_memory_kib() -> u32 {
    DEFAULT_KDF_MEMORY_KIB
}
fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}
fn default_kdf_parallelism() -> u32 {
    DEFAULT_KDF_PARALLELISM
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl QueueConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            max_members: default_max_group_members(),
            max_name_length: default_max_group_name_length(),
        }
    }
}

impl Default for MessagePolicy {
    fn default() -> Self {
        Self {
            max_length: default_max_message_length(),
            edit_window_secs: default_edit_window_secs(),
            delete_window_secs: default_delete_window_secs(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl MessagePolicy {
    pub fn edit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.edit_window_secs as i64)
    }

    pub fn delete_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delete_window_secs as i64)
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_kdf_memory_kib(),
            iterations: default_kdf_iterations(),
            parallelism: default_kdf_parallelism(),
        }
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(cfg: &KdfConfig) -> Self {
        KdfParams {
            memory_kib: cfg.memory_kib,
            iterations: cfg.iterations,
            parallelism: cfg.parallelism,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue_db_path: default_queue_db_path(),
            erasure_url: default_erasure_url(),
            queue: QueueConfig::default(),
            groups: GroupPolicy::default(),
            messages: MessagePolicy::default(),
            kdf: KdfConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Reads `ciphertalk.toml` from CWD (or path in `CONFIG_PATH` env var),
    /// then overrides individual fields from env vars. A missing file falls
    /// back to the defaults.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "ciphertalk.toml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config: ClientConfig = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if an env var is set but has an invalid format
    /// (e.g., CIPHERTALK_MAX_RETRIES=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("CIPHERTALK_QUEUE_DB") {
            self.queue_db_path = val;
        }
        if let Ok(val) = std::env::var("CIPHERTALK_ERASURE_URL") {
            self.erasure_url = val;
        }
        if let Ok(val) = std::env::var("CIPHERTALK_MAX_RETRIES") {
            self.queue.max_retries = val
                .parse()
                .map_err(|_| format!("invalid CIPHERTALK_MAX_RETRIES value: {val}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let multiplier = self.queue.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err("queue.backoff_multiplier must be a finite number of at least 1.0".into());
        }
        if self.queue.max_retries > MAX_QUEUE_RETRIES {
            return Err(format!("queue.max_retries must be at most {MAX_QUEUE_RETRIES}").into());
        }
        if self.groups.max_members < 2 {
            return Err("groups.max_members must allow at least two members".into());
        }
        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::from(&self.kdf)
    }
}
