use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, UserId};

/// A direct (1:1) or group conversation.
///
/// Direct conversations identify their two members through
/// `participant_1_id`/`participant_2_id`; group membership lives in
/// [`ConversationMember`] rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub participant_1_id: Option<UserId>,
    pub participant_2_id: Option<UserId>,
    pub group_name: Option<String>,
    pub created_by: UserId,
    pub current_key_version: i32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new_direct(created_by: UserId, peer: UserId) -> Self {
        Self {
            id: ConversationId::new(),
            is_group: false,
            participant_1_id: Some(created_by),
            participant_2_id: Some(peer),
            group_name: None,
            created_by,
            current_key_version: 1,
            last_message_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_group(created_by: UserId, group_name: Option<String>) -> Self {
        Self {
            id: ConversationId::new(),
            is_group: true,
            participant_1_id: None,
            participant_2_id: None,
            group_name,
            created_by,
            current_key_version: 1,
            last_message_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether `user_id` is one of the two participants of a direct conversation.
    pub fn is_direct_participant(&self, user_id: UserId) -> bool {
        !self.is_group
            && (self.participant_1_id == Some(user_id) || self.participant_2_id == Some(user_id))
    }

    /// The other participant of a direct conversation.
    pub fn direct_peer(&self, user_id: UserId) -> Option<UserId> {
        if !self.is_direct_participant(user_id) {
            return None;
        }
        if self.participant_1_id == Some(user_id) {
            self.participant_2_id
        } else {
            self.participant_1_id
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

/// Whether the group key has been delivered to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pending,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    /// Non-null means the member was soft-removed or left.
    pub left_at: Option<DateTime<Utc>>,
    pub key_version_joined: i32,
    pub key_status: KeyStatus,
    pub archived: bool,
    pub muted: bool,
}

impl ConversationMember {
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        role: MemberRole,
        key_version: i32,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            joined_at: Utc::now(),
            left_at: None,
            key_version_joined: key_version,
            key_status: KeyStatus::Pending,
            archived: false,
            muted: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn is_owner(&self) -> bool {
        self.is_active() && self.role == MemberRole::Owner
    }
}

/// A group key wrapped for exactly one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyRecord {
    pub conversation_id: ConversationId,
    pub key_version: i32,
    pub member_user_id: UserId,
    /// User whose key pair wrapped this copy; needed to re-derive the wrapping secret.
    pub distributed_by: UserId,
    pub encrypted_key: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_peer_resolves_both_directions() {
        let a = UserId::new();
        let b = UserId::new();
        let conv = Conversation::new_direct(a, b);
        assert_eq!(conv.direct_peer(a), Some(b));
        assert_eq!(conv.direct_peer(b), Some(a));
        assert_eq!(conv.direct_peer(UserId::new()), None);
    }

    #[test]
    fn group_has_no_direct_participants() {
        let owner = UserId::new();
        let conv = Conversation::new_group(owner, Some("Team".into()));
        assert!(conv.is_group);
        assert_eq!(conv.current_key_version, 1);
        assert!(!conv.is_direct_participant(owner));
    }

    #[test]
    fn left_member_is_not_owner() {
        let mut member =
            ConversationMember::new(ConversationId::new(), UserId::new(), MemberRole::Owner, 1);
        assert!(member.is_owner());
        member.left_at = Some(Utc::now());
        assert!(!member.is_owner());
        assert!(!member.is_active());
    }

    #[test]
    fn new_member_starts_pending() {
        let member =
            ConversationMember::new(ConversationId::new(), UserId::new(), MemberRole::Member, 3);
        assert_eq!(member.key_status, KeyStatus::Pending);
        assert_eq!(member.key_version_joined, 3);
    }
}
