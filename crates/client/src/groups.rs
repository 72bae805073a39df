//! Group lifecycle: creation, membership changes, ownership transfer,
//! upgrade from a direct conversation, rename and deletion.
//!
//! Every active group has exactly one active owner. Members start `pending`
//! and become `active` once their wrapped copy of the group key is stored.
//! Creation and upgrade are rolled back when no member other than the owner
//! received the key.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use ciphertalk_crypto::SymmetricKey;
use ciphertalk_shared::error::{ChatError, GroupErrorCode};
use ciphertalk_shared::ids::{ConversationId, UserId};
use ciphertalk_shared::model::{Conversation, ConversationMember, KeyStatus, MemberRole};

use crate::auth::{require_user, AuthProvider};
use crate::config::GroupPolicy;
use crate::group_keys::{DistributionOutcome, GroupKeyService};
use crate::keys::KeyManagementService;
use crate::store::Repositories;

/// A group together with how its first key distribution went.
#[derive(Debug, Clone)]
pub struct CreatedGroup {
    pub conversation: Conversation,
    pub distribution: DistributionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The sole owner left an otherwise empty group, so it was deleted.
    GroupDeleted,
}

pub struct GroupService {
    repos: Repositories,
    auth: Arc<dyn AuthProvider>,
    keys: Arc<KeyManagementService>,
    group_keys: Arc<GroupKeyService>,
    policy: GroupPolicy,
    /// Serializes rotations from this client so each one reads the version the
    /// previous one wrote.
    rotation: tokio::sync::Mutex<()>,
}

impl GroupService {
    pub fn new(
        repos: Repositories,
        auth: Arc<dyn AuthProvider>,
        keys: Arc<KeyManagementService>,
        group_keys: Arc<GroupKeyService>,
        policy: GroupPolicy,
    ) -> Self {
        Self {
            repos,
            auth,
            keys,
            group_keys,
            policy,
            rotation: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn create_group(
        &self,
        name: Option<&str>,
        member_ids: &[UserId],
    ) -> Result<CreatedGroup, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;

        if member_ids.is_empty() {
            return Err(ChatError::validation(
                "member_ids",
                "a group needs at least one other member",
            ));
        }
        self.check_capacity(member_ids.len() + 1)?;
        check_new_member_ids(user.id, member_ids)?;
        let group_name = self.normalize_name(name)?;
        self.check_connected_with_keys(user.id, member_ids).await?;
        self.keys.require_current_keys()?;

        let conversation = self
            .repos
            .conversations
            .insert(Conversation::new_group(user.id, group_name))
            .await?;
        let conversation_id = conversation.id;
        let version = conversation.current_key_version;

        let mut everyone = Vec::with_capacity(member_ids.len() + 1);
        everyone.push(user.id);
        everyone.extend_from_slice(member_ids);

        if let Err(e) = self.insert_members(conversation_id, user.id, &everyone, version).await {
            self.discard_group(conversation_id).await;
            return Err(e);
        }

        let key = self.group_keys.generate_group_key();
        let distribution = match self
            .distribute_to_members(conversation_id, &key, &everyone, version, user.id)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "group creation rolled back");
                self.discard_group(conversation_id).await;
                return Err(e);
            }
        };
        self.activate(conversation_id, &distribution.successful).await;

        tracing::info!(
            conversation_id = %conversation_id,
            owner_id = %user.id,
            members = member_ids.len(),
            pending = distribution.pending.len(),
            "group created"
        );
        Ok(CreatedGroup {
            conversation,
            distribution,
        })
    }

    /// Add members at the group's current key version. Users already active
    /// are skipped.
    pub async fn add_members(
        &self,
        conversation_id: ConversationId,
        member_ids: &[UserId],
    ) -> Result<DistributionOutcome, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let conversation = self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        if member_ids.is_empty() {
            return Err(ChatError::validation("member_ids", "no members to add"));
        }
        check_new_member_ids(user.id, member_ids)?;

        let active: HashSet<UserId> = self
            .repos
            .members
            .list_active(conversation_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        let new_ids: Vec<UserId> = member_ids
            .iter()
            .copied()
            .filter(|id| !active.contains(id))
            .collect();
        if new_ids.is_empty() {
            return Err(ChatError::group(
                GroupErrorCode::AlreadyMember,
                "every requested user is already a member",
            ));
        }
        self.check_capacity(active.len() + new_ids.len())?;
        self.check_connected_with_keys(user.id, &new_ids).await?;
        self.keys.require_current_keys()?;

        let version = conversation.current_key_version;
        let key = self.group_keys.get_group_key(conversation_id, version).await?;

        for (idx, &member) in new_ids.iter().enumerate() {
            let row = ConversationMember::new(conversation_id, member, MemberRole::Member, version);
            if let Err(e) = self.repos.members.insert(row).await {
                let now = Utc::now();
                for &added in &new_ids[..idx] {
                    if let Err(undo) = self.repos.members.mark_left(conversation_id, added, now).await {
                        tracing::error!(conversation_id = %conversation_id, member_id = %added, error = %undo, "failed to undo member insert");
                    }
                }
                return Err(e);
            }
        }

        let outcome = self
            .distribute_or_pending(conversation_id, &key, &new_ids, version)
            .await?;
        self.activate(conversation_id, &outcome.successful).await;

        tracing::info!(
            conversation_id = %conversation_id,
            added = new_ids.len(),
            pending = outcome.pending.len(),
            "members added"
        );
        Ok(outcome)
    }

    /// Owner-only soft removal. The key is rotated afterwards so the removed
    /// member cannot read later messages; a failed rotation is logged.
    pub async fn remove_member(
        &self,
        conversation_id: ConversationId,
        member_id: UserId,
    ) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        if member_id == user.id {
            return Err(ChatError::group(
                GroupErrorCode::InvalidState,
                "the owner cannot remove themself; leave the group instead",
            ));
        }
        self.require_active_member(conversation_id, member_id).await?;

        self.repos
            .members
            .mark_left(conversation_id, member_id, Utc::now())
            .await?;
        tracing::info!(conversation_id = %conversation_id, member_id = %member_id, "member removed");

        if let Err(e) = self.rotate_group_key(conversation_id).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "key rotation after removal failed");
        }
        Ok(())
    }

    pub async fn leave_group(&self, conversation_id: ConversationId) -> Result<LeaveOutcome, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.load_group(conversation_id).await?;
        let me = self.require_active_member(conversation_id, user.id).await?;

        if me.role == MemberRole::Owner {
            let others = self
                .repos
                .members
                .list_active(conversation_id)
                .await?
                .into_iter()
                .filter(|m| m.user_id != user.id)
                .count();
            if others > 0 {
                return Err(ChatError::group(
                    GroupErrorCode::OwnerMustTransfer,
                    "transfer ownership before leaving the group",
                ));
            }
            self.repos.conversations.delete(conversation_id).await?;
            self.group_keys.evict_conversation(conversation_id);
            tracing::info!(conversation_id = %conversation_id, "sole owner left, group deleted");
            return Ok(LeaveOutcome::GroupDeleted);
        }

        self.repos
            .members
            .mark_left(conversation_id, user.id, Utc::now())
            .await?;
        self.group_keys.evict_conversation(conversation_id);
        tracing::info!(conversation_id = %conversation_id, user_id = %user.id, "left group");
        Ok(LeaveOutcome::Left)
    }

    /// Demote the caller, then promote `new_owner`. A failed promotion
    /// restores the caller as owner.
    pub async fn transfer_ownership(
        &self,
        conversation_id: ConversationId,
        new_owner: UserId,
    ) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        if new_owner == user.id {
            return Err(ChatError::validation(
                "new_owner_id",
                "ownership cannot be transferred to yourself",
            ));
        }
        self.require_active_member(conversation_id, new_owner).await?;

        let members = &self.repos.members;
        members
            .set_role(conversation_id, user.id, MemberRole::Member)
            .await?;
        if let Err(e) = members
            .set_role(conversation_id, new_owner, MemberRole::Owner)
            .await
        {
            if let Err(undo) = members
                .set_role(conversation_id, user.id, MemberRole::Owner)
                .await
            {
                tracing::error!(conversation_id = %conversation_id, error = %undo, "failed to restore owner after aborted transfer");
            } else {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "ownership transfer rolled back");
            }
            return Err(e);
        }

        tracing::info!(
            conversation_id = %conversation_id,
            from = %user.id,
            to = %new_owner,
            "ownership transferred"
        );
        Ok(())
    }

    /// Turn a direct conversation into a group owned by the caller, with the
    /// existing peer and any extra members.
    pub async fn upgrade_to_group(
        &self,
        conversation_id: ConversationId,
        name: Option<&str>,
        extra_member_ids: &[UserId],
    ) -> Result<CreatedGroup, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let original = self
            .repos
            .conversations
            .get(conversation_id)
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        if original.is_group {
            return Err(ChatError::group(
                GroupErrorCode::InvalidState,
                "conversation is already a group",
            ));
        }
        let peer = original.direct_peer(user.id).ok_or_else(|| {
            ChatError::group(GroupErrorCode::NotMember, "not a participant of this conversation")
        })?;

        check_new_member_ids(user.id, extra_member_ids)?;
        if extra_member_ids.contains(&peer) {
            return Err(ChatError::validation(
                "member_ids",
                "the existing participant is already included",
            ));
        }
        self.check_capacity(extra_member_ids.len() + 2)?;
        let group_name = self.normalize_name(name)?;
        self.check_connected_with_keys(user.id, extra_member_ids).await?;
        if self.keys.get_user_public_key(peer).await?.is_none() {
            return Err(ChatError::group(
                GroupErrorCode::MissingPublicKey,
                format!("user {peer} has not published an encryption key"),
            ));
        }
        self.keys.require_current_keys()?;

        if !self
            .repos
            .conversations
            .convert_to_group(conversation_id, group_name.clone())
            .await?
        {
            return Err(ChatError::group(
                GroupErrorCode::InvalidState,
                "conversation is already a group",
            ));
        }
        let mut upgraded = original;
        upgraded.is_group = true;
        upgraded.group_name = group_name;
        let version = upgraded.current_key_version;

        let mut everyone = vec![user.id, peer];
        everyone.extend_from_slice(extra_member_ids);

        if let Err(e) = self.insert_members(conversation_id, user.id, &everyone, version).await {
            self.restore_direct(conversation_id).await;
            return Err(e);
        }

        let key = self.group_keys.generate_group_key();
        let distribution = match self
            .distribute_to_members(conversation_id, &key, &everyone, version, user.id)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.restore_direct(conversation_id).await;
                return Err(e);
            }
        };
        self.activate(conversation_id, &distribution.successful).await;

        tracing::info!(conversation_id = %conversation_id, members = everyone.len(), "direct conversation upgraded to group");
        Ok(CreatedGroup {
            conversation: upgraded,
            distribution,
        })
    }

    /// Owner-only. Members, group keys and messages go with the conversation.
    pub async fn delete_group(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        self.repos.conversations.delete(conversation_id).await?;
        self.group_keys.evict_conversation(conversation_id);
        tracing::info!(conversation_id = %conversation_id, "group deleted");
        Ok(())
    }

    pub async fn rename_group(
        &self,
        conversation_id: ConversationId,
        name: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let mut conversation = self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        conversation.group_name = self.normalize_name(name)?;
        self.repos
            .conversations
            .set_name(conversation_id, conversation.group_name.clone())
            .await?;
        Ok(conversation)
    }

    /// Owner-only. Distribute a fresh key to every active member at the next
    /// version, then advance the group's current version. Fails with
    /// `INVALID_STATE` if another writer advanced the version meanwhile.
    pub async fn rotate_group_key(
        &self,
        conversation_id: ConversationId,
    ) -> Result<DistributionOutcome, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let _rotating = self.rotation.lock().await;
        let conversation = self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;
        self.keys.require_current_keys()?;

        let members: Vec<UserId> = self
            .repos
            .members
            .list_active(conversation_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        let current_version = conversation.current_key_version;
        let next_version = current_version + 1;
        let key = self.group_keys.generate_group_key();
        let outcome = self
            .group_keys
            .distribute_group_key(conversation_id, &key, &members, next_version)
            .await?;

        if !self
            .repos
            .conversations
            .set_key_version(conversation_id, current_version, next_version)
            .await?
        {
            self.group_keys.evict_conversation(conversation_id);
            return Err(ChatError::group(
                GroupErrorCode::InvalidState,
                format!("group key version moved past {current_version} during rotation"),
            ));
        }

        self.activate(conversation_id, &outcome.successful).await;
        for &member in &outcome.pending {
            if let Err(e) = self
                .repos
                .members
                .set_key_status(conversation_id, member, KeyStatus::Pending)
                .await
            {
                tracing::warn!(conversation_id = %conversation_id, member_id = %member, error = %e, "failed to mark member pending");
            }
        }

        tracing::info!(
            conversation_id = %conversation_id,
            key_version = next_version,
            pending = outcome.pending.len(),
            "group key rotated"
        );
        Ok(outcome)
    }

    /// Owner-only. Retry delivering the current key to every pending member.
    pub async fn redistribute_pending_keys(
        &self,
        conversation_id: ConversationId,
    ) -> Result<DistributionOutcome, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        let conversation = self.load_group(conversation_id).await?;
        self.require_owner(conversation_id, user.id).await?;

        let pending: Vec<UserId> = self
            .repos
            .members
            .list_active(conversation_id)
            .await?
            .into_iter()
            .filter(|m| m.key_status == KeyStatus::Pending)
            .map(|m| m.user_id)
            .collect();
        if pending.is_empty() {
            return Ok(DistributionOutcome::default());
        }

        let version = conversation.current_key_version;
        let key = self.group_keys.get_group_key(conversation_id, version).await?;
        let outcome = self
            .distribute_or_pending(conversation_id, &key, &pending, version)
            .await?;
        self.activate(conversation_id, &outcome.successful).await;
        Ok(outcome)
    }

    /// Active members; the caller must be one of them.
    pub async fn list_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationMember>, ChatError> {
        let user = require_user(self.auth.as_ref()).await?;
        self.load_group(conversation_id).await?;
        self.require_active_member(conversation_id, user.id).await?;
        self.repos.members.list_active(conversation_id).await
    }

    async fn load_group(&self, conversation_id: ConversationId) -> Result<Conversation, ChatError> {
        let conversation = self
            .repos
            .conversations
            .get(conversation_id)
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        if !conversation.is_group {
            return Err(ChatError::group(
                GroupErrorCode::InvalidState,
                "conversation is not a group",
            ));
        }
        Ok(conversation)
    }

    async fn require_active_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<ConversationMember, ChatError> {
        match self.repos.members.get(conversation_id, user_id).await? {
            Some(member) if member.is_active() => Ok(member),
            _ => Err(ChatError::group(
                GroupErrorCode::NotMember,
                format!("user {user_id} is not a member of this group"),
            )),
        }
    }

    async fn require_owner(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<ConversationMember, ChatError> {
        let member = self.require_active_member(conversation_id, user_id).await?;
        if !member.is_owner() {
            return Err(ChatError::group(
                GroupErrorCode::NotOwner,
                "only the group owner can do this",
            ));
        }
        Ok(member)
    }

    fn check_capacity(&self, total: usize) -> Result<(), ChatError> {
        if total > self.policy.max_members {
            return Err(ChatError::group(
                GroupErrorCode::AtCapacity,
                format!(
                    "a group holds at most {} members, {total} requested",
                    self.policy.max_members
                ),
            ));
        }
        Ok(())
    }

    /// Trimmed name, `None` when blank.
    fn normalize_name(&self, name: Option<&str>) -> Result<Option<String>, ChatError> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        if name.chars().count() > self.policy.max_name_length {
            return Err(ChatError::validation(
                "group_name",
                format!(
                    "group name must be at most {} characters",
                    self.policy.max_name_length
                ),
            ));
        }
        Ok(Some(name.to_string()))
    }

    async fn check_connected_with_keys(
        &self,
        user_id: UserId,
        member_ids: &[UserId],
    ) -> Result<(), ChatError> {
        for &member in member_ids {
            if !self.repos.connections.are_connected(user_id, member).await? {
                return Err(ChatError::group(
                    GroupErrorCode::NotConnected,
                    format!("user {member} is not a connection"),
                ));
            }
        }
        for &member in member_ids {
            if self.keys.get_user_public_key(member).await?.is_none() {
                return Err(ChatError::group(
                    GroupErrorCode::MissingPublicKey,
                    format!("user {member} has not published an encryption key"),
                ));
            }
        }
        Ok(())
    }

    async fn insert_members(
        &self,
        conversation_id: ConversationId,
        owner: UserId,
        everyone: &[UserId],
        version: i32,
    ) -> Result<(), ChatError> {
        for &member in everyone {
            let role = if member == owner {
                MemberRole::Owner
            } else {
                MemberRole::Member
            };
            self.repos
                .members
                .insert(ConversationMember::new(conversation_id, member, role, version))
                .await?;
        }
        Ok(())
    }

    /// Distribute to a freshly created member set. Fails unless at least one
    /// member besides the owner received the key.
    async fn distribute_to_members(
        &self,
        conversation_id: ConversationId,
        key: &SymmetricKey,
        everyone: &[UserId],
        version: i32,
        owner: UserId,
    ) -> Result<DistributionOutcome, ChatError> {
        let outcome = self
            .group_keys
            .distribute_group_key(conversation_id, key, everyone, version)
            .await?;
        if !outcome.successful.iter().any(|&m| m != owner) {
            return Err(ChatError::group(
                GroupErrorCode::KeyDistributionFailed,
                "group key could not be delivered to any member",
            ));
        }
        Ok(outcome)
    }

    /// Like [`GroupKeyService::distribute_group_key`], but a total failure
    /// leaves everyone pending instead of erroring.
    async fn distribute_or_pending(
        &self,
        conversation_id: ConversationId,
        key: &SymmetricKey,
        member_ids: &[UserId],
        version: i32,
    ) -> Result<DistributionOutcome, ChatError> {
        match self
            .group_keys
            .distribute_group_key(conversation_id, key, member_ids, version)
            .await
        {
            Err(e) if e.group_code() == Some(GroupErrorCode::KeyDistributionFailed) => {
                tracing::warn!(conversation_id = %conversation_id, "no member received the group key; all left pending");
                Ok(DistributionOutcome {
                    successful: Vec::new(),
                    pending: member_ids.to_vec(),
                })
            }
            other => other,
        }
    }

    async fn activate(&self, conversation_id: ConversationId, members: &[UserId]) {
        for &member in members {
            if let Err(e) = self
                .repos
                .members
                .set_key_status(conversation_id, member, KeyStatus::Active)
                .await
            {
                tracing::warn!(conversation_id = %conversation_id, member_id = %member, error = %e, "failed to mark member active");
            }
        }
    }

    async fn discard_group(&self, conversation_id: ConversationId) {
        self.group_keys.evict_conversation(conversation_id);
        if let Err(e) = self.repos.conversations.delete(conversation_id).await {
            tracing::error!(conversation_id = %conversation_id, error = %e, "failed to roll back group creation");
        }
    }

    async fn restore_direct(&self, conversation_id: ConversationId) {
        self.group_keys.evict_conversation(conversation_id);
        if let Err(e) = self
            .repos
            .members
            .delete_for_conversation(conversation_id)
            .await
        {
            tracing::error!(conversation_id = %conversation_id, error = %e, "failed to remove members during upgrade rollback");
        }
        if let Err(e) = self
            .repos
            .group_keys
            .delete_for_conversation(conversation_id)
            .await
        {
            tracing::error!(conversation_id = %conversation_id, error = %e, "failed to remove group keys during upgrade rollback");
        }
        if let Err(e) = self.repos.conversations.revert_to_direct(conversation_id).await {
            tracing::error!(conversation_id = %conversation_id, error = %e, "failed to restore direct conversation");
        } else {
            tracing::warn!(conversation_id = %conversation_id, "group upgrade rolled back");
        }
    }
}

/// Rejects duplicates and the caller's own id.
fn check_new_member_ids(caller: UserId, member_ids: &[UserId]) -> Result<(), ChatError> {
    let mut seen = HashSet::with_capacity(member_ids.len());
    for &id in member_ids {
        if id == caller {
            return Err(ChatError::validation(
                "member_ids",
                "you cannot add yourself as a member",
            ));
        }
        if !seen.insert(id) {
            return Err(ChatError::validation(
                "member_ids",
                format!("user {id} is listed more than once"),
            ));
        }
    }
    Ok(())
}
