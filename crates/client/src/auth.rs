//! Identity boundary. The messaging services only ever ask "who is signed in"
//! and "what is their access token"; how the session was obtained is outside
//! this crate.

use std::sync::Mutex;

use async_trait::async_trait;
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub access_token: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<AuthUser>;
    async fn session(&self) -> Option<Session>;
    async fn sign_out(&self) -> Result<(), ChatError>;
}

/// Resolve the signed-in user or fail with [`ChatError::Authentication`].
pub async fn require_user(auth: &dyn AuthProvider) -> Result<AuthUser, ChatError> {
    auth.current_user().await.ok_or(ChatError::Authentication)
}

/// In-process provider holding a single session. Used by the CLI and tests.
#[derive(Default)]
pub struct StaticAuth {
    state: Mutex<Option<(AuthUser, Session)>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: AuthUser, access_token: impl Into<String>) -> Self {
        let auth = Self::new();
        auth.sign_in(user, access_token);
        auth
    }

    pub fn sign_in(&self, user: AuthUser, access_token: impl Into<String>) {
        let session = Session {
            user_id: user.id,
            access_token: access_token.into(),
        };
        *self.lock() = Some((user, session));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(AuthUser, Session)>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Option<AuthUser> {
        self.lock().as_ref().map(|(user, _)| user.clone())
    }

    async fn session(&self) -> Option<Session> {
        self.lock().as_ref().map(|(_, session)| session.clone())
    }

    async fn sign_out(&self) -> Result<(), ChatError> {
        *self.lock() = None;
        Ok(())
    }
}
