#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ciphertalk_client::auth::{AuthUser, StaticAuth};
use ciphertalk_client::config::{ClientConfig, KdfConfig};
use ciphertalk_client::connectivity::NetworkStatus;
use ciphertalk_client::erasure::ErasureClient;
use ciphertalk_client::queue::open_queue_db_in_memory;
use ciphertalk_client::store::{MemoryStore, Repositories};
use ciphertalk_client::ChatClient;
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::UserId;
use ciphertalk_shared::model::Profile;

pub const PASSWORD: &str = "correct horse battery staple";

/// Argon2 settings cheap enough for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        kdf: KdfConfig {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        },
        ..ClientConfig::default()
    }
}

/// Records erasure calls; optionally answers with a server-side failure.
#[derive(Default)]
pub struct RecordingErasure {
    pub tokens: Mutex<Vec<String>>,
    pub failure: Mutex<Option<String>>,
}

impl RecordingErasure {
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}

#[async_trait]
impl ErasureClient for RecordingErasure {
    async fn erase_account(&self, access_token: &str) -> Result<(), ChatError> {
        self.tokens.lock().unwrap().push(access_token.to_string());
        match self.failure.lock().unwrap().clone() {
            Some(reason) => Err(ChatError::Connection(reason)),
            None => Ok(()),
        }
    }
}

pub struct TestUser {
    pub id: UserId,
    pub auth: Arc<StaticAuth>,
    pub network: Arc<NetworkStatus>,
    pub erasure: Arc<RecordingErasure>,
    pub client: ChatClient,
}

/// Several users sharing one in-memory backend, each with their own client.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub config: ClientConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            store: MemoryStore::new(),
            config,
        }
    }

    pub fn repos(&self) -> Repositories {
        self.store.repositories()
    }

    /// A signed-in user without encryption keys.
    pub fn user(&self, name: &str) -> TestUser {
        self.user_with_repos(name, self.repos())
    }

    /// Like [`Harness::user`], but the client talks to `repos`.
    pub fn user_with_repos(&self, name: &str, repos: Repositories) -> TestUser {
        let id = UserId::new();
        let email = format!("{name}@example.com");
        self.store.add_profile(Profile {
            user_id: id,
            email: email.clone(),
            display_name: Some(name.to_string()),
            created_at: Utc::now(),
        });

        let auth = Arc::new(StaticAuth::signed_in(AuthUser { id, email }, format!("token-{name}")));
        let network = Arc::new(NetworkStatus::new(true));
        let erasure = Arc::new(RecordingErasure::default());
        let client = ChatClient::new(
            repos,
            auth.clone(),
            network.clone(),
            erasure.clone(),
            open_queue_db_in_memory().unwrap(),
            &self.config,
        );
        TestUser {
            id,
            auth,
            network,
            erasure,
            client,
        }
    }

    /// A signed-in user whose key pair is published and unlocked.
    pub async fn user_with_keys(&self, name: &str) -> TestUser {
        let user = self.user(name);
        user.client.keys.initialize_keys(PASSWORD).await.unwrap();
        user
    }

    pub fn connect(&self, a: &TestUser, b: &TestUser) {
        self.store.connect(a.id, b.id);
    }

    /// Owner connected to every member.
    pub fn connect_all(&self, owner: &TestUser, members: &[&TestUser]) {
        for member in members {
            self.connect(owner, member);
        }
    }
}
