//! Privileged remote account erasure. The endpoint cascades the delete through
//! profile, conversations, messages and keys on the storage side.

use std::time::Duration;

use async_trait::async_trait;
use ciphertalk_shared::error::ChatError;
use reqwest::Client;
use serde::Deserialize;

#[async_trait]
pub trait ErasureClient: Send + Sync {
    async fn erase_account(&self, access_token: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Deserialize)]
struct ErasureResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn connection_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Connection("request timed out".into())
    } else if e.is_connect() {
        ChatError::Connection("could not connect to server".into())
    } else {
        ChatError::Connection(format!("network request failed: {e}"))
    }
}

pub struct HttpErasureClient {
    endpoint: String,
    http_client: Client,
}

impl HttpErasureClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ChatError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ChatError::Connection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ErasureClient for HttpErasureClient {
    async fn erase_account(&self, access_token: &str) -> Result<(), ChatError> {
        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(connection_error)?;

        let status = resp.status();
        let body = resp.json::<ErasureResponse>().await.ok();
        match body {
            Some(ErasureResponse { success: true, .. }) if status.is_success() => Ok(()),
            Some(ErasureResponse {
                error: Some(reason),
                ..
            }) => Err(ChatError::Connection(reason)),
            _ => Err(ChatError::Connection(format!(
                "account deletion failed (HTTP {status})"
            ))),
        }
    }
}
