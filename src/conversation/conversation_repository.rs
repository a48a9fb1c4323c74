//! Durable storage for conversations and their messages.
//!
//! Services talk to [`ConversationStore`]; [`ConversationRepository`] is the
//! Postgres implementation. The uniqueness of a conversation per unordered
//! pair is enforced by the store itself (`conversations_pair_unique`), so
//! callers never read-then-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::Result,
    message::message_models::{Message, MessageWithSender, PendingMessage},
    user::PublicProfile,
};
use super::conversation_models::{Conversation, ConversationSummary, UserPair};

/// Rows per INSERT statement during a bulk write. Five binds per row keeps
/// each statement well below the Postgres limit of 65535 parameters.
const BULK_INSERT_CHUNK: usize = 1000;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the conversation for `pair`, inserting it if absent, in one
    /// atomic step. Concurrent callers for the same pair all get the same row.
    async fn find_or_create_conversation(&self, pair: UserPair) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;

    async fn list_user_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>>;

    async fn create_message(&self, message: PendingMessage) -> Result<Message>;

    /// Inserts the whole batch or nothing, preserving slice order. Returns
    /// the number of rows written.
    async fn insert_messages(&self, batch: &[PendingMessage]) -> Result<u64>;

    /// All messages of a conversation, oldest first.
    async fn find_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageWithSender>>;

    /// Sets `is_read`. Returns `None` if the message does not exist.
    async fn mark_read(&self, message_id: Uuid) -> Result<Option<Message>>;
}

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    is_read: bool,
    created_at: DateTime<Utc>,
    sender_username: Option<String>,
    sender_firstname: Option<String>,
    sender_lastname: Option<String>,
    sender_profile_image_url: Option<String>,
}

impl From<MessageRow> for MessageWithSender {
    fn from(row: MessageRow) -> Self {
        let sender = match (row.sender_username, row.sender_firstname, row.sender_lastname) {
            (Some(username), Some(firstname), Some(lastname)) => Some(PublicProfile {
                id: row.sender_id,
                firstname,
                lastname,
                username,
                profile_image_url: row.sender_profile_image_url,
            }),
            _ => None,
        };

        Self {
            message: Message {
                id: row.id,
                conversation_id: row.conversation_id,
                sender_id: row.sender_id,
                content: row.content,
                is_read: row.is_read,
                created_at: row.created_at,
            },
            sender,
        }
    }
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    async fn find_or_create_conversation(&self, pair: UserPair) -> Result<Conversation> {
        // The no-op DO UPDATE makes RETURNING yield the existing row on conflict.
        let conversation = sqlx::query_as::<_, Conversation>(
            "INSERT INTO conversations (user1_id, user2_id)
             VALUES ($1, $2)
             ON CONFLICT ON CONSTRAINT conversations_pair_unique
             DO UPDATE SET user1_id = EXCLUDED.user1_id
             RETURNING id, user1_id, user2_id, created_at",
        )
        .bind(pair.first())
        .bind(pair.second())
        .fetch_one(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT id, user1_id, user2_id, created_at FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn list_user_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let conversations = sqlx::query_as::<_, ConversationSummary>(
            "SELECT
                u.id,
                c.id AS conversation_id,
                u.firstname,
                u.lastname,
                u.username,
                u.profile_image_url,
                u.bio
             FROM conversations c
             JOIN users u ON u.id = CASE
                WHEN c.user1_id = $1 THEN c.user2_id
                ELSE c.user1_id
             END
             WHERE c.user1_id = $1 OR c.user2_id = $1
             ORDER BY c.created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(conversations)
    }

    async fn create_message(&self, message: PendingMessage) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (conversation_id, sender_id, content, is_read, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, conversation_id, sender_id, content, is_read, created_at",
        )
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.content)
        .bind(message.is_read)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    async fn insert_messages(&self, batch: &[PendingMessage]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in batch.chunks(BULK_INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO messages (conversation_id, sender_id, content, is_read, created_at) ",
            );
            builder.push_values(chunk, |mut row, message| {
                row.push_bind(message.conversation_id)
                    .push_bind(message.sender_id)
                    .push_bind(message.content.clone())
                    .push_bind(message.is_read)
                    .push_bind(message.created_at);
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        Ok(inserted)
    }

    async fn find_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageWithSender>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT
                m.id,
                m.conversation_id,
                m.sender_id,
                m.content,
                m.is_read,
                m.created_at,
                u.username AS sender_username,
                u.firstname AS sender_firstname,
                u.lastname AS sender_lastname,
                u.profile_image_url AS sender_profile_image_url
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = $1
             ORDER BY m.created_at ASC, m.seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MessageWithSender::from).collect())
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            "UPDATE messages
             SET is_read = TRUE
             WHERE id = $1
             RETURNING id, conversation_id, sender_id, content, is_read, created_at",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }
}
