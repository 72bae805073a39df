//! In-memory implementation of every repository trait, with switches to
//! simulate remote write failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::{ConversationId, KeyRecordId, MessageId, UserId};
use ciphertalk_shared::model::{
    Connection, ConnectionStatus, Conversation, ConversationMember, GroupKeyRecord, KeyStatus,
    MemberRole, Message, NewKeyRecord, NewMessage, Profile, UserEncryptionKeyRecord,
};

use super::{
    ConnectionRepository, ConversationRepository, GroupKeyRepository, KeyRepository,
    MemberRepository, MessageRepository, ProfileRepository, Repositories,
};

#[derive(Default)]
struct Faults {
    group_key_writes_for: HashSet<UserId>,
    member_inserts: bool,
    promotion_of: HashSet<UserId>,
    message_inserts: bool,
}

#[derive(Default)]
struct State {
    keys: Vec<UserEncryptionKeyRecord>,
    conversations: HashMap<ConversationId, Conversation>,
    members: Vec<ConversationMember>,
    group_keys: Vec<GroupKeyRecord>,
    messages: Vec<Message>,
    connections: Vec<Connection>,
    profiles: HashMap<UserId, Profile>,
    faults: Faults,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn simulated(what: &str) -> ChatError {
    ChatError::Connection(format!("simulated failure writing {what}"))
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Trait-object handles backed by this store.
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            keys: self.clone(),
            conversations: self.clone(),
            members: self.clone(),
            group_keys: self.clone(),
            messages: self.clone(),
            connections: self.clone(),
            profiles: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.user_id, profile);
    }

    pub fn add_connection(&self, connection: Connection) {
        self.lock().connections.push(connection);
    }

    /// Records an accepted connection requested by `a`.
    pub fn connect(&self, a: UserId, b: UserId) {
        self.add_connection(Connection {
            requester_id: a,
            recipient_id: b,
            status: ConnectionStatus::Accepted,
            created_at: Utc::now(),
        });
    }

    /// Moves a message's send time, e.g. to push it outside the edit window.
    pub fn backdate_message(&self, id: MessageId, created_at: DateTime<Utc>) {
        if let Some(msg) = self.lock().messages.iter_mut().find(|m| m.id == id) {
            msg.created_at = created_at;
        }
    }

    pub fn fail_group_key_writes_for(&self, user_id: UserId) {
        self.lock().faults.group_key_writes_for.insert(user_id);
    }

    pub fn fail_member_inserts(&self, fail: bool) {
        self.lock().faults.member_inserts = fail;
    }

    /// Promoting `user_id` to owner fails; other role changes still succeed.
    pub fn fail_promotion_of(&self, user_id: UserId) {
        self.lock().faults.promotion_of.insert(user_id);
    }

    pub fn fail_message_inserts(&self, fail: bool) {
        self.lock().faults.message_inserts = fail;
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    pub fn conversation_count(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn key_record_count(&self, user_id: UserId) -> usize {
        self.lock().keys.iter().filter(|k| k.user_id == user_id).count()
    }
}

#[async_trait]
impl KeyRepository for MemoryStore {
    async fn insert(&self, record: NewKeyRecord) -> Result<UserEncryptionKeyRecord, ChatError> {
        let row = UserEncryptionKeyRecord {
            id: KeyRecordId::new(),
            user_id: record.user_id,
            public_key: record.public_key,
            encryption_salt: record.encryption_salt,
            created_at: Utc::now(),
            revoked_at: None,
        };
        self.lock().keys.push(row.clone());
        Ok(row)
    }

    async fn find_active(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserEncryptionKeyRecord>, ChatError> {
        Ok(self
            .lock()
            .keys
            .iter()
            .filter(|k| k.user_id == user_id && k.is_active())
            .max_by_key(|k| (k.created_at, k.id))
            .cloned())
    }

    async fn has_salted_key(&self, user_id: UserId) -> Result<bool, ChatError> {
        Ok(self
            .lock()
            .keys
            .iter()
            .any(|k| k.user_id == user_id && k.is_active() && !k.is_legacy()))
    }

    async fn has_any_key(&self, user_id: UserId) -> Result<bool, ChatError> {
        Ok(self
            .lock()
            .keys
            .iter()
            .any(|k| k.user_id == user_id && k.is_active()))
    }

    async fn revoke(&self, user_id: UserId) -> Result<u64, ChatError> {
        let now = Utc::now();
        let mut changed = 0;
        for key in self
            .lock()
            .keys
            .iter_mut()
            .filter(|k| k.user_id == user_id && k.is_active())
        {
            key.revoked_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn insert(&self, conversation: Conversation) -> Result<Conversation, ChatError> {
        self.lock()
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ChatError> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn find_direct(&self, a: UserId, b: UserId) -> Result<Option<Conversation>, ChatError> {
        Ok(self
            .lock()
            .conversations
            .values()
            .find(|c| c.is_direct_participant(a) && c.direct_peer(a) == Some(b))
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>, ChatError> {
        let state = self.lock();
        let mut out: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| {
                if c.is_group {
                    state
                        .members
                        .iter()
                        .any(|m| m.conversation_id == c.id && m.user_id == user_id && m.is_active())
                } else {
                    c.is_direct_participant(user_id)
                }
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let a_at = a.last_message_at.unwrap_or(a.created_at);
            let b_at = b.last_message_at.unwrap_or(b.created_at);
            b_at.cmp(&a_at)
        });
        Ok(out)
    }

    async fn list_involving(&self, user_id: UserId) -> Result<Vec<Conversation>, ChatError> {
        let state = self.lock();
        let mut out: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| {
                c.is_direct_participant(user_id)
                    || state
                        .members
                        .iter()
                        .any(|m| m.conversation_id == c.id && m.user_id == user_id)
                    || state
                        .messages
                        .iter()
                        .any(|m| m.conversation_id == c.id && m.sender_id == user_id)
            })
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn set_name(&self, id: ConversationId, name: Option<String>) -> Result<(), ChatError> {
        let mut state = self.lock();
        let conv = state
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::NotFound("conversation"))?;
        conv.group_name = name;
        Ok(())
    }

    async fn set_key_version(
        &self,
        id: ConversationId,
        expected: i32,
        next: i32,
    ) -> Result<bool, ChatError> {
        let mut state = self.lock();
        let conv = state
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::NotFound("conversation"))?;
        if conv.current_key_version != expected {
            return Ok(false);
        }
        conv.current_key_version = next;
        Ok(true)
    }

    async fn convert_to_group(
        &self,
        id: ConversationId,
        name: Option<String>,
    ) -> Result<bool, ChatError> {
        let mut state = self.lock();
        let conv = state
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::NotFound("conversation"))?;
        if conv.is_group {
            return Ok(false);
        }
        conv.is_group = true;
        conv.group_name = name;
        Ok(true)
    }

    async fn revert_to_direct(&self, id: ConversationId) -> Result<(), ChatError> {
        let mut state = self.lock();
        let conv = state
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::NotFound("conversation"))?;
        conv.is_group = false;
        conv.group_name = None;
        Ok(())
    }

    async fn touch_last_message(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        if let Some(conv) = self.lock().conversations.get_mut(&id) {
            conv.last_message_at = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, id: ConversationId) -> Result<(), ChatError> {
        let mut state = self.lock();
        state.conversations.remove(&id);
        state.members.retain(|m| m.conversation_id != id);
        state.group_keys.retain(|k| k.conversation_id != id);
        state.messages.retain(|m| m.conversation_id != id);
        Ok(())
    }
}

#[async_trait]
impl MemberRepository for MemoryStore {
    async fn insert(&self, member: ConversationMember) -> Result<(), ChatError> {
        let mut state = self.lock();
        if state.faults.member_inserts {
            return Err(simulated("conversation member"));
        }
        match state
            .members
            .iter()
            .position(|m| m.conversation_id == member.conversation_id && m.user_id == member.user_id)
        {
            Some(idx) => state.members[idx] = member,
            None => state.members.push(member),
        }
        Ok(())
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ConversationMember>, ChatError> {
        Ok(self
            .lock()
            .members
            .iter()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .cloned())
    }

    async fn list_active(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationMember>, ChatError> {
        let mut members: Vec<ConversationMember> = self
            .lock()
            .members
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.is_active())
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn set_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<(), ChatError> {
        let mut state = self.lock();
        if role == MemberRole::Owner && state.faults.promotion_of.contains(&user_id) {
            return Err(simulated("member role"));
        }
        let member = state
            .members
            .iter_mut()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .ok_or(ChatError::NotFound("conversation member"))?;
        member.role = role;
        Ok(())
    }

    async fn set_key_status(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        status: KeyStatus,
    ) -> Result<(), ChatError> {
        let mut state = self.lock();
        let member = state
            .members
            .iter_mut()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .ok_or(ChatError::NotFound("conversation member"))?;
        member.key_status = status;
        Ok(())
    }

    async fn mark_left(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let mut state = self.lock();
        let member = state
            .members
            .iter_mut()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .ok_or(ChatError::NotFound("conversation member"))?;
        member.left_at = Some(at);
        Ok(())
    }

    async fn delete_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ChatError> {
        self.lock()
            .members
            .retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }
}

#[async_trait]
impl GroupKeyRepository for MemoryStore {
    async fn insert(&self, record: GroupKeyRecord) -> Result<(), ChatError> {
        let mut state = self.lock();
        if state
            .faults
            .group_key_writes_for
            .contains(&record.member_user_id)
        {
            return Err(simulated("group key"));
        }
        match state.group_keys.iter().position(|k| {
            k.conversation_id == record.conversation_id
                && k.key_version == record.key_version
                && k.member_user_id == record.member_user_id
        }) {
            Some(idx) => state.group_keys[idx] = record,
            None => state.group_keys.push(record),
        }
        Ok(())
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        key_version: i32,
        member_user_id: UserId,
    ) -> Result<Option<GroupKeyRecord>, ChatError> {
        Ok(self
            .lock()
            .group_keys
            .iter()
            .find(|k| {
                k.conversation_id == conversation_id
                    && k.key_version == key_version
                    && k.member_user_id == member_user_id
            })
            .cloned())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<GroupKeyRecord>, ChatError> {
        Ok(self
            .lock()
            .group_keys
            .iter()
            .filter(|k| k.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn delete_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ChatError> {
        self.lock()
            .group_keys
            .retain(|k| k.conversation_id != conversation_id);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn last_sequence_number(&self, conversation_id: ConversationId) -> Result<i64, ChatError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.sequence_number)
            .max()
            .unwrap_or(0))
    }

    async fn insert(&self, message: NewMessage) -> Result<Message, ChatError> {
        let mut state = self.lock();
        if state.faults.message_inserts {
            return Err(simulated("message"));
        }
        if state.messages.iter().any(|m| {
            m.conversation_id == message.conversation_id
                && m.sequence_number == message.sequence_number
        }) {
            return Err(ChatError::Connection(format!(
                "duplicate sequence number {} in conversation",
                message.sequence_number
            )));
        }
        let row = Message {
            id: MessageId::new(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            encrypted_content: message.encrypted_content,
            initialization_vector: message.initialization_vector,
            sequence_number: message.sequence_number,
            key_version: message.key_version,
            edited: false,
            edited_at: None,
            deleted: false,
            delivered_at: None,
            read_at: None,
            created_at: message.created_at,
        };
        state.messages.push(row.clone());
        Ok(row)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, ChatError> {
        Ok(self.lock().messages.iter().find(|m| m.id == id).cloned())
    }

    async fn update_content(
        &self,
        id: MessageId,
        encrypted_content: String,
        initialization_vector: String,
        key_version: Option<i32>,
        edited_at: DateTime<Utc>,
    ) -> Result<Message, ChatError> {
        let mut state = self.lock();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ChatError::NotFound("message"))?;
        msg.encrypted_content = encrypted_content;
        msg.initialization_vector = initialization_vector;
        msg.key_version = key_version;
        msg.edited = true;
        msg.edited_at = Some(edited_at);
        Ok(msg.clone())
    }

    async fn mark_deleted(&self, id: MessageId) -> Result<(), ChatError> {
        let mut state = self.lock();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(ChatError::NotFound("message"))?;
        msg.deleted = true;
        Ok(())
    }

    async fn mark_read(
        &self,
        ids: &[MessageId],
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, ChatError> {
        let mut changed = 0;
        for msg in self.lock().messages.iter_mut().filter(|m| {
            ids.contains(&m.id) && m.sender_id != reader && m.read_at.is_none() && !m.deleted
        }) {
            msg.read_at = Some(at);
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_page(
        &self,
        conversation_id: ConversationId,
        before_sequence: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let mut page: Vec<Message> = self
            .lock()
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && !m.deleted
                    && before_sequence.map_or(true, |cursor| m.sequence_number < cursor)
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| b.sequence_number.cmp(&a.sequence_number));
        page.truncate(limit);
        Ok(page)
    }

    async fn list_all(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ChatError> {
        let mut all: Vec<Message> = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        all.sort_by_key(|m| m.sequence_number);
        Ok(all)
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Connection>, ChatError> {
        Ok(self
            .lock()
            .connections
            .iter()
            .filter(|c| c.involves(user_id))
            .cloned()
            .collect())
    }

    async fn are_connected(&self, a: UserId, b: UserId) -> Result<bool, ChatError> {
        Ok(self.lock().connections.iter().any(|c| {
            c.status == ConnectionStatus::Accepted && c.involves(a) && c.other(a) == b && a != b
        }))
    }
}

#[async_trait]
impl ProfileRepository for MemoryStore {
    async fn get(&self, user_id: UserId) -> Result<Option<Profile>, ChatError> {
        Ok(self.lock().profiles.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(conv: ConversationId, sender: UserId, seq: i64) -> NewMessage {
        NewMessage {
            conversation_id: conv,
            sender_id: sender,
            encrypted_content: format!("ct-{seq}"),
            initialization_vector: "iv".into(),
            sequence_number: seq,
            key_version: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_sequence_numbers_are_rejected() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let conv = ConversationId::new();
        let sender = UserId::new();
        repos.messages.insert(new_message(conv, sender, 1)).await.unwrap();
        let dup = repos.messages.insert(new_message(conv, sender, 1)).await;
        assert!(matches!(dup, Err(ChatError::Connection(_))));
        assert_eq!(repos.messages.last_sequence_number(conv).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn page_excludes_deleted_and_respects_cursor() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let conv = ConversationId::new();
        let sender = UserId::new();
        let mut ids = Vec::new();
        for seq in 1..=5 {
            ids.push(repos.messages.insert(new_message(conv, sender, seq)).await.unwrap().id);
        }
        repos.messages.mark_deleted(ids[3]).await.unwrap();

        let page = repos.messages.list_page(conv, None, 10).await.unwrap();
        let seqs: Vec<i64> = page.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![5, 3, 2, 1]);

        let older = repos.messages.list_page(conv, Some(3), 10).await.unwrap();
        let seqs: Vec<i64> = older.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![2, 1]);

        assert_eq!(repos.messages.list_all(conv).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn member_insert_reactivates_previous_row() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let conv = ConversationId::new();
        let user = UserId::new();
        repos
            .members
            .insert(ConversationMember::new(conv, user, MemberRole::Member, 1))
            .await
            .unwrap();
        repos.members.mark_left(conv, user, Utc::now()).await.unwrap();
        assert!(repos.members.list_active(conv).await.unwrap().is_empty());

        repos
            .members
            .insert(ConversationMember::new(conv, user, MemberRole::Member, 2))
            .await
            .unwrap();
        let active = repos.members.list_active(conv).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key_version_joined, 2);
    }

    #[tokio::test]
    async fn deleting_a_conversation_cascades() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let owner = UserId::new();
        let conv = repos
            .conversations
            .insert(Conversation::new_group(owner, None))
            .await
            .unwrap();
        repos
            .members
            .insert(ConversationMember::new(conv.id, owner, MemberRole::Owner, 1))
            .await
            .unwrap();
        repos.messages.insert(new_message(conv.id, owner, 1)).await.unwrap();

        repos.conversations.delete(conv.id).await.unwrap();
        assert!(repos.conversations.get(conv.id).await.unwrap().is_none());
        assert!(repos.members.list_active(conv.id).await.unwrap().is_empty());
        assert!(repos.messages.list_all(conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_version_only_advances_from_the_expected_value() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let conv = repos
            .conversations
            .insert(Conversation::new_group(UserId::new(), None))
            .await
            .unwrap();

        assert!(repos.conversations.set_key_version(conv.id, 1, 2).await.unwrap());
        assert!(!repos.conversations.set_key_version(conv.id, 1, 2).await.unwrap());
        assert!(!repos.conversations.set_key_version(conv.id, 3, 4).await.unwrap());
        let stored = repos.conversations.get(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.current_key_version, 2);

        let missing = repos.conversations.set_key_version(ConversationId::new(), 1, 2).await;
        assert!(matches!(missing, Err(ChatError::NotFound("conversation"))));
    }

    #[tokio::test]
    async fn targeted_writes_keep_other_columns() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let (a, b) = (UserId::new(), UserId::new());
        let conv = repos
            .conversations
            .insert(Conversation::new_direct(a, b))
            .await
            .unwrap();
        let at = Utc::now();
        repos.conversations.touch_last_message(conv.id, at).await.unwrap();

        assert!(repos
            .conversations
            .convert_to_group(conv.id, Some("trio".into()))
            .await
            .unwrap());
        assert!(!repos.conversations.convert_to_group(conv.id, None).await.unwrap());
        repos
            .conversations
            .set_name(conv.id, Some("renamed".into()))
            .await
            .unwrap();
        let stored = repos.conversations.get(conv.id).await.unwrap().unwrap();
        assert!(stored.is_group);
        assert_eq!(stored.group_name.as_deref(), Some("renamed"));
        assert_eq!(stored.last_message_at, Some(at));

        repos.conversations.revert_to_direct(conv.id).await.unwrap();
        let stored = repos.conversations.get(conv.id).await.unwrap().unwrap();
        assert!(!stored.is_group);
        assert_eq!(stored.group_name, None);
        assert_eq!(stored.direct_peer(a), Some(b));
        assert_eq!(stored.last_message_at, Some(at));
    }

    #[tokio::test]
    async fn involving_includes_groups_the_user_left() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let (owner, user) = (UserId::new(), UserId::new());
        let conv = repos
            .conversations
            .insert(Conversation::new_group(owner, None))
            .await
            .unwrap();
        repos
            .members
            .insert(ConversationMember::new(conv.id, user, MemberRole::Member, 1))
            .await
            .unwrap();
        repos.members.mark_left(conv.id, user, Utc::now()).await.unwrap();

        assert!(repos.conversations.list_for_user(user).await.unwrap().is_empty());
        let involving = repos.conversations.list_involving(user).await.unwrap();
        assert_eq!(involving.len(), 1);
        assert_eq!(involving[0].id, conv.id);
        assert!(repos
            .conversations
            .list_involving(UserId::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn only_accepted_connections_count() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        store.connect(a, b);
        store.add_connection(Connection {
            requester_id: a,
            recipient_id: c,
            status: ConnectionStatus::Pending,
            created_at: Utc::now(),
        });
        assert!(repos.connections.are_connected(b, a).await.unwrap());
        assert!(!repos.connections.are_connected(a, c).await.unwrap());
        assert_eq!(repos.connections.list_for_user(a).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn revoke_deactivates_all_records() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let user = UserId::new();
        repos
            .keys
            .insert(NewKeyRecord {
                user_id: user,
                public_key: "{}".into(),
                encryption_salt: Some("c2FsdA==".into()),
            })
            .await
            .unwrap();
        assert!(repos.keys.has_salted_key(user).await.unwrap());
        assert_eq!(repos.keys.revoke(user).await.unwrap(), 1);
        assert!(repos.keys.find_active(user).await.unwrap().is_none());
        assert!(!repos.keys.has_any_key(user).await.unwrap());
    }
}
