use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    message::message_models::{Message, PendingMessage},
    user::PublicProfile,
};

// Server-to-client messages
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    ReceiveMessage(ReceiveMessagePayload),
    CreateConversationReply(CreateConversationReplyPayload),
    Error(ErrorPayload),
    Ping,
    Pong,
}

/// A chat message as fanned out to a room. Messages still waiting in the
/// ingestion queue have no `id` yet.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub sender: PublicProfile,
}

impl ReceiveMessagePayload {
    pub fn queued(record: &PendingMessage, sender: PublicProfile) -> Self {
        Self {
            id: None,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content.clone(),
            is_read: record.is_read,
            created_at: record.created_at,
            sender,
        }
    }

    pub fn stored(message: &Message, sender: PublicProfile) -> Self {
        Self {
            id: Some(message.id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            is_read: message.is_read,
            created_at: message.created_at,
            sender,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationReplyPayload {
    /// Echo of the request's `ackId`, for correlating the reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorPayload {
    pub message: String,
}

// Client-to-server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom(JoinRoomRequest),
    CreateConversation(CreateConversationRequest),
    SendMessage(SendMessageEvent),
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub user_id: Uuid,
    pub sender_id: Uuid,
    #[serde(default)]
    pub ack_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageEvent {
    pub conversation_id: Uuid,
    pub message: String,
    pub sender_id: Uuid,
}
