use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Blocked,
}

/// A relationship between two users. `requester_id` initiated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub requester_id: UserId,
    pub recipient_id: UserId,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.requester_id == user_id || self.recipient_id == user_id
    }

    /// The other side of the relationship, seen from `user_id`.
    pub fn other(&self, user_id: UserId) -> UserId {
        if self.requester_id == user_id {
            self.recipient_id
        } else {
            self.requester_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
