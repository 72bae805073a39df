mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{test_config, Harness, PASSWORD};

use ciphertalk_client::groups::LeaveOutcome;
use ciphertalk_client::store::{ConversationRepository, GroupKeyRepository, MemoryStore};
use ciphertalk_shared::error::{ChatError, GroupErrorCode};
use ciphertalk_shared::ids::{ConversationId, UserId};
use ciphertalk_shared::model::{GroupKeyRecord, KeyStatus, MemberRole};

fn group_code(err: &ChatError) -> Option<GroupErrorCode> {
    err.group_code()
}

/// What another writer does to the conversation row while version-2 key
/// records are being stored.
enum Interference {
    Touch(DateTime<Utc>),
    AdvanceVersion,
}

/// Group key repository that lets another writer act mid-rotation.
struct InterferingKeys {
    store: Arc<MemoryStore>,
    interference: Interference,
}

#[async_trait]
impl GroupKeyRepository for InterferingKeys {
    async fn insert(&self, record: GroupKeyRecord) -> Result<(), ChatError> {
        if record.key_version == 2 {
            let conversations: &dyn ConversationRepository = self.store.as_ref();
            match self.interference {
                Interference::Touch(at) => {
                    conversations
                        .touch_last_message(record.conversation_id, at)
                        .await?
                }
                Interference::AdvanceVersion => {
                    conversations
                        .set_key_version(record.conversation_id, 1, 2)
                        .await?;
                }
            }
        }
        GroupKeyRepository::insert(self.store.as_ref(), record).await
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        key_version: i32,
        member_user_id: UserId,
    ) -> Result<Option<GroupKeyRecord>, ChatError> {
        GroupKeyRepository::get(self.store.as_ref(), conversation_id, key_version, member_user_id)
            .await
    }

    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<GroupKeyRecord>, ChatError> {
        GroupKeyRepository::list_for_conversation(self.store.as_ref(), conversation_id).await
    }

    async fn delete_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ChatError> {
        GroupKeyRepository::delete_for_conversation(self.store.as_ref(), conversation_id).await
    }
}

async fn owner_with_interference(harness: &Harness, interference: Interference) -> common::TestUser {
    let mut repos = harness.repos();
    repos.group_keys = Arc::new(InterferingKeys {
        store: harness.store.clone(),
        interference,
    });
    let owner = harness.user_with_repos("owner", repos);
    owner.client.keys.initialize_keys(PASSWORD).await.unwrap();
    owner
}

#[tokio::test]
async fn create_group_writes_owner_and_member_rows_with_keys() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);

    let created = owner
        .client
        .groups
        .create_group(Some("  Weekend trip  "), &[bob.id, carol.id])
        .await
        .unwrap();
    let conv = created.conversation;
    assert!(conv.is_group);
    assert_eq!(conv.current_key_version, 1);
    assert_eq!(conv.group_name.as_deref(), Some("Weekend trip"));
    assert!(created.distribution.pending.is_empty());

    let repos = harness.repos();
    let members = repos.members.list_active(conv.id).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|m| m.key_status == KeyStatus::Active));
    let owners: Vec<_> = members.iter().filter(|m| m.role == MemberRole::Owner).collect();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].user_id, owner.id);

    let records = repos.group_keys.list_for_conversation(conv.id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.key_version == 1));

    // Every member recovers the same key from their own record.
    let k_owner = owner.client.group_keys.get_group_key(conv.id, 1).await.unwrap();
    let k_bob = bob.client.group_keys.get_group_key(conv.id, 1).await.unwrap();
    let k_carol = carol.client.group_keys.get_group_key(conv.id, 1).await.unwrap();
    assert_eq!(k_owner.as_bytes(), k_bob.as_bytes());
    assert_eq!(k_owner.as_bytes(), k_carol.as_bytes());
}

#[tokio::test]
async fn create_group_over_capacity_persists_nothing() {
    let mut config = test_config();
    config.groups.max_members = 3;
    let harness = Harness::with_config(config);
    let owner = harness.user_with_keys("owner").await;
    let a = harness.user_with_keys("a").await;
    let b = harness.user_with_keys("b").await;
    let c = harness.user_with_keys("c").await;
    harness.connect_all(&owner, &[&a, &b, &c]);

    let err = owner
        .client
        .groups
        .create_group(None, &[a.id, b.id, c.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::AtCapacity));
    assert_eq!(harness.store.conversation_count(), 0);
}

#[tokio::test]
async fn create_group_requires_connections_and_keys() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let stranger = harness.user_with_keys("stranger").await;
    let keyless = harness.user("keyless");
    harness.connect(&owner, &keyless);

    let err = owner
        .client
        .groups
        .create_group(None, &[stranger.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::NotConnected));

    let err = owner
        .client
        .groups
        .create_group(None, &[keyless.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::MissingPublicKey));
    assert_eq!(harness.store.conversation_count(), 0);
}

#[tokio::test]
async fn create_group_validates_name_length() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let long_name = "x".repeat(101);
    let err = owner
        .client
        .groups
        .create_group(Some(&long_name), &[bob.id])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation { field: "group_name", .. }));
}

#[tokio::test]
async fn create_group_rolls_back_when_no_member_gets_the_key() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);
    harness.store.fail_group_key_writes_for(bob.id);

    let err = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::KeyDistributionFailed));
    assert_eq!(harness.store.conversation_count(), 0);
    assert!(owner.client.group_keys.cached_len() == 0);
}

#[tokio::test]
async fn partial_distribution_leaves_member_pending_until_redistributed() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);
    harness.store.fail_group_key_writes_for(carol.id);

    let created = owner
        .client
        .groups
        .create_group(None, &[bob.id, carol.id])
        .await
        .unwrap();
    assert_eq!(created.distribution.pending, vec![carol.id]);
    let conv_id = created.conversation.id;

    let repos = harness.repos();
    let carol_row = repos.members.get(conv_id, carol.id).await.unwrap().unwrap();
    assert_eq!(carol_row.key_status, KeyStatus::Pending);

    harness.store.clear_faults();
    let outcome = owner
        .client
        .groups
        .redistribute_pending_keys(conv_id)
        .await
        .unwrap();
    assert_eq!(outcome.successful, vec![carol.id]);
    let carol_row = repos.members.get(conv_id, carol.id).await.unwrap().unwrap();
    assert_eq!(carol_row.key_status, KeyStatus::Active);
    carol.client.group_keys.get_group_key(conv_id, 1).await.unwrap();
}

#[tokio::test]
async fn add_members_keeps_key_version_and_skips_existing() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let outcome = owner
        .client
        .groups
        .add_members(conv_id, &[bob.id, carol.id])
        .await
        .unwrap();
    assert_eq!(outcome.successful, vec![carol.id]);

    let repos = harness.repos();
    let conv = repos.conversations.get(conv_id).await.unwrap().unwrap();
    assert_eq!(conv.current_key_version, 1);
    assert_eq!(repos.members.list_active(conv_id).await.unwrap().len(), 3);

    let err = owner
        .client
        .groups
        .add_members(conv_id, &[bob.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::AlreadyMember));

    // The new member reads the key in use before they joined.
    let k_owner = owner.client.group_keys.get_group_key(conv_id, 1).await.unwrap();
    let k_carol = carol.client.group_keys.get_group_key(conv_id, 1).await.unwrap();
    assert_eq!(k_owner.as_bytes(), k_carol.as_bytes());
}

#[tokio::test]
async fn only_the_owner_manages_members() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);
    harness.connect(&bob, &carol);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let err = bob
        .client
        .groups
        .add_members(conv_id, &[carol.id])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::NotOwner));

    let err = carol.client.groups.list_members(conv_id).await.unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::NotMember));
}

#[tokio::test]
async fn removing_a_member_rotates_the_key() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id, carol.id])
        .await
        .unwrap()
        .conversation
        .id;

    owner.client.groups.remove_member(conv_id, carol.id).await.unwrap();

    let repos = harness.repos();
    let conv = repos.conversations.get(conv_id).await.unwrap().unwrap();
    assert_eq!(conv.current_key_version, 2);
    let carol_row = repos.members.get(conv_id, carol.id).await.unwrap().unwrap();
    assert!(carol_row.left_at.is_some());

    bob.client.group_keys.get_group_key(conv_id, 2).await.unwrap();
    let err = carol.client.group_keys.get_group_key(conv_id, 2).await.unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn owner_cannot_leave_while_others_remain() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let err = owner.client.groups.leave_group(conv_id).await.unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::OwnerMustTransfer));

    assert_eq!(bob.client.groups.leave_group(conv_id).await.unwrap(), LeaveOutcome::Left);
    assert_eq!(
        owner.client.groups.leave_group(conv_id).await.unwrap(),
        LeaveOutcome::GroupDeleted
    );
    assert_eq!(harness.store.conversation_count(), 0);
}

#[tokio::test]
async fn ownership_transfer_swaps_roles() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    owner.client.groups.transfer_ownership(conv_id, bob.id).await.unwrap();

    let repos = harness.repos();
    let old = repos.members.get(conv_id, owner.id).await.unwrap().unwrap();
    let new = repos.members.get(conv_id, bob.id).await.unwrap().unwrap();
    assert_eq!(old.role, MemberRole::Member);
    assert_eq!(new.role, MemberRole::Owner);

    // The former owner may now leave.
    assert_eq!(owner.client.groups.leave_group(conv_id).await.unwrap(), LeaveOutcome::Left);
}

#[tokio::test]
async fn failed_promotion_restores_the_original_owner() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    harness.store.fail_promotion_of(bob.id);
    let err = owner
        .client
        .groups
        .transfer_ownership(conv_id, bob.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Connection(_)));
    harness.store.clear_faults();

    let repos = harness.repos();
    let owner_row = repos.members.get(conv_id, owner.id).await.unwrap().unwrap();
    let bob_row = repos.members.get(conv_id, bob.id).await.unwrap().unwrap();
    assert_eq!(owner_row.role, MemberRole::Owner);
    assert_eq!(bob_row.role, MemberRole::Member);
}

#[tokio::test]
async fn upgrade_turns_a_direct_conversation_into_a_group() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&alice, &[&bob, &carol]);

    let direct = alice
        .client
        .messages
        .get_or_create_direct_conversation(bob.id)
        .await
        .unwrap();

    let upgraded = alice
        .client
        .groups
        .upgrade_to_group(direct.id, Some("Trio"), &[carol.id])
        .await
        .unwrap();
    assert_eq!(upgraded.conversation.id, direct.id);
    assert!(upgraded.conversation.is_group);

    let members = bob.client.groups.list_members(direct.id).await.unwrap();
    assert_eq!(members.len(), 3);
    let owner = members.iter().find(|m| m.role == MemberRole::Owner).unwrap();
    assert_eq!(owner.user_id, alice.id);

    let err = alice
        .client
        .groups
        .upgrade_to_group(direct.id, None, &[])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::InvalidState));
}

#[tokio::test]
async fn failed_upgrade_restores_the_direct_conversation() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&alice, &bob);

    let direct = alice
        .client
        .messages
        .get_or_create_direct_conversation(bob.id)
        .await
        .unwrap();

    harness.store.fail_group_key_writes_for(bob.id);
    let err = alice
        .client
        .groups
        .upgrade_to_group(direct.id, None, &[])
        .await
        .unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::KeyDistributionFailed));

    let repos = harness.repos();
    let restored = repos.conversations.get(direct.id).await.unwrap().unwrap();
    assert!(!restored.is_group);
    assert_eq!(restored.group_name, None);
    assert!(repos.members.list_active(direct.id).await.unwrap().is_empty());
    // The owner's own copy of the discarded key goes too.
    assert!(repos
        .group_keys
        .list_for_conversation(direct.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rotation_keeps_activity_written_meanwhile() {
    let harness = Harness::new();
    let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let owner = owner_with_interference(&harness, Interference::Touch(at)).await;
    let bob = harness.user_with_keys("bob").await;
    let carol = harness.user_with_keys("carol").await;
    harness.connect_all(&owner, &[&bob, &carol]);

    let conv_id = owner
        .client
        .groups
        .create_group(Some("crew"), &[bob.id, carol.id])
        .await
        .unwrap()
        .conversation
        .id;
    owner.client.groups.remove_member(conv_id, carol.id).await.unwrap();

    let conv = harness.repos().conversations.get(conv_id).await.unwrap().unwrap();
    assert_eq!(conv.current_key_version, 2);
    assert_eq!(conv.last_message_at, Some(at));
    assert_eq!(conv.group_name.as_deref(), Some("crew"));
}

#[tokio::test]
async fn rotation_refuses_a_version_advanced_by_another_writer() {
    let harness = Harness::new();
    let owner = owner_with_interference(&harness, Interference::AdvanceVersion).await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let err = owner.client.groups.rotate_group_key(conv_id).await.unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::InvalidState));
    let conv = harness.repos().conversations.get(conv_id).await.unwrap().unwrap();
    assert_eq!(conv.current_key_version, 2);
}

#[tokio::test]
async fn overlapping_rotations_use_distinct_versions() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(None, &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let (first, second) = tokio::join!(
        owner.client.groups.rotate_group_key(conv_id),
        owner.client.groups.rotate_group_key(conv_id)
    );
    first.unwrap();
    second.unwrap();

    let conv = harness.repos().conversations.get(conv_id).await.unwrap().unwrap();
    assert_eq!(conv.current_key_version, 3);
    let v2 = bob.client.group_keys.get_group_key(conv_id, 2).await.unwrap();
    let v3 = bob.client.group_keys.get_group_key(conv_id, 3).await.unwrap();
    assert_ne!(v2.as_bytes(), v3.as_bytes());
    let owner_v3 = owner.client.group_keys.get_group_key(conv_id, 3).await.unwrap();
    assert_eq!(owner_v3.as_bytes(), v3.as_bytes());
}

#[tokio::test]
async fn rename_and_delete_are_owner_only() {
    let harness = Harness::new();
    let owner = harness.user_with_keys("owner").await;
    let bob = harness.user_with_keys("bob").await;
    harness.connect(&owner, &bob);

    let conv_id = owner
        .client
        .groups
        .create_group(Some("old"), &[bob.id])
        .await
        .unwrap()
        .conversation
        .id;

    let renamed = owner
        .client
        .groups
        .rename_group(conv_id, Some("new"))
        .await
        .unwrap();
    assert_eq!(renamed.group_name.as_deref(), Some("new"));

    let err = bob.client.groups.delete_group(conv_id).await.unwrap_err();
    assert_eq!(group_code(&err), Some(GroupErrorCode::NotOwner));

    owner.client.groups.delete_group(conv_id).await.unwrap();
    assert_eq!(harness.store.conversation_count(), 0);
}
