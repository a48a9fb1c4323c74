//! In-process store used by the test suites. Holds the same contracts as the
//! Postgres schema: one conversation per pair, all-or-nothing bulk inserts,
//! reads ordered by `(created_at, insertion order)`, no NUL bytes in `TEXT`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    conversation::{Conversation, ConversationStore, ConversationSummary, UserPair},
    error::{AppError, Result},
    message::message_models::{Message, MessageWithSender, PendingMessage},
    user::{PublicProfile, UserDirectory},
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, (PublicProfile, Option<String>)>,
    conversations: Vec<Conversation>,
    by_pair: HashMap<UserPair, usize>,
    messages: Vec<Message>,
}

/// Parks bulk inserts until released, so tests can act mid-flush.
#[derive(Default)]
pub struct InsertGate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing_inserts: AtomicU32,
    bulk_insert_calls: AtomicU32,
    insert_gate: Mutex<Option<Arc<InsertGate>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_user(&self, username: &str) -> PublicProfile {
        let profile = PublicProfile {
            id: Uuid::new_v4(),
            firstname: username.to_uppercase(),
            lastname: "Tester".to_string(),
            username: username.to_string(),
            profile_image_url: Some(format!("https://img.example/{}.png", username)),
        };
        self.tables()
            .users
            .insert(profile.id, (profile.clone(), Some(format!("bio of {}", username))));
        profile
    }

    /// The next `count` bulk inserts fail with a storage error.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Every following bulk insert signals `entered` and waits for `release`.
    pub fn hold_inserts(&self) -> Arc<InsertGate> {
        let gate = Arc::new(InsertGate::default());
        *self.gate_slot() = Some(gate.clone());
        gate
    }

    pub fn release_inserts(&self) {
        *self.gate_slot() = None;
    }

    fn gate_slot(&self) -> MutexGuard<'_, Option<Arc<InsertGate>>> {
        self.insert_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bulk_insert_calls(&self) -> u32 {
        self.bulk_insert_calls.load(Ordering::SeqCst)
    }

    pub fn conversation_count(&self) -> usize {
        self.tables().conversations.len()
    }

    pub fn message_count(&self) -> usize {
        self.tables().messages.len()
    }

    pub fn all_messages(&self) -> Vec<Message> {
        self.tables().messages.clone()
    }

    fn take_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Mirrors Postgres rejecting `\0` in a `TEXT` column (SQLSTATE 22021).
fn check_encodable(batch: &[PendingMessage]) -> Result<()> {
    if batch.iter().any(|m| m.content.contains('\0')) {
        return Err(AppError::Database(sqlx::Error::Encode(
            "invalid byte sequence for encoding \"UTF8\": 0x00".into(),
        )));
    }
    Ok(())
}

fn stored(message: &PendingMessage) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        content: message.content.clone(),
        is_read: message.is_read,
        created_at: message.created_at,
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn find_or_create_conversation(&self, pair: UserPair) -> Result<Conversation> {
        // Yield so concurrent callers really interleave in tests.
        tokio::task::yield_now().await;

        let mut tables = self.tables();
        if let Some(&index) = tables.by_pair.get(&pair) {
            return Ok(tables.conversations[index].clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            user1_id: pair.first(),
            user2_id: pair.second(),
            created_at: Utc::now(),
        };
        let index = tables.conversations.len();
        tables.conversations.push(conversation.clone());
        tables.by_pair.insert(pair, index);

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self
            .tables()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn list_user_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let tables = self.tables();
        let summaries = tables
            .conversations
            .iter()
            .rev()
            .filter(|c| c.has_participant(user_id))
            .filter_map(|c| {
                let other = if c.user1_id == user_id { c.user2_id } else { c.user1_id };
                tables.users.get(&other).map(|(profile, bio)| ConversationSummary {
                    id: profile.id,
                    conversation_id: c.id,
                    firstname: profile.firstname.clone(),
                    lastname: profile.lastname.clone(),
                    username: profile.username.clone(),
                    profile_image_url: profile.profile_image_url.clone(),
                    bio: bio.clone(),
                })
            })
            .collect();

        Ok(summaries)
    }

    async fn create_message(&self, message: PendingMessage) -> Result<Message> {
        check_encodable(std::slice::from_ref(&message))?;
        let message = stored(&message);
        self.tables().messages.push(message.clone());
        Ok(message)
    }

    async fn insert_messages(&self, batch: &[PendingMessage]) -> Result<u64> {
        self.bulk_insert_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let gate = self.gate_slot().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if self.take_failure() {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        check_encodable(batch)?;

        let mut tables = self.tables();
        tables.messages.extend(batch.iter().map(stored));
        Ok(batch.len() as u64)
    }

    async fn find_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageWithSender>> {
        let tables = self.tables();
        let mut messages: Vec<MessageWithSender> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| MessageWithSender {
                message: m.clone(),
                sender: tables.users.get(&m.sender_id).map(|(profile, _)| profile.clone()),
            })
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        messages.sort_by_key(|m| m.message.created_at);

        Ok(messages)
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<Option<Message>> {
        let mut tables = self.tables();
        Ok(tables.messages.iter_mut().find(|m| m.id == message_id).map(|m| {
            m.is_read = true;
            m.clone()
        }))
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn find_public_profile(&self, user_id: Uuid) -> Result<Option<PublicProfile>> {
        Ok(self.tables().users.get(&user_id).map(|(profile, _)| profile.clone()))
    }
}
