use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use crate::{
    conversation::{ConversationResolver, ConversationStore, ConversationSummary},
    error::{AppError, Result},
    user::UserDirectory,
    websocket::{
        types::{ReceiveMessagePayload, WsMessage},
        ConnectionManager,
    },
};
use super::{
    check_content,
    message_models::{Message, MessageWithSender, PendingMessage},
};

/// Synchronous message operations behind the REST routes. Unlike the realtime
/// path, `send` writes straight to the store.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ConversationStore>,
    users: Arc<dyn UserDirectory>,
    resolver: ConversationResolver,
    ws_manager: ConnectionManager,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        users: Arc<dyn UserDirectory>,
        resolver: ConversationResolver,
        ws_manager: ConnectionManager,
    ) -> Self {
        Self {
            store,
            users,
            resolver,
            ws_manager,
        }
    }

    pub async fn send_message(
        &self,
        sender_id: Uuid,
        other_party_id: Uuid,
        content: String,
    ) -> Result<Message> {
        check_content(&content)?;

        let sender = self
            .users
            .find_public_profile(sender_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Sender not found".to_string()))?;
        if !self.users.exists(other_party_id).await? {
            return Err(AppError::NotFound("User not found".to_string()));
        }

        let conversation = self.resolver.resolve_or_create(sender_id, other_party_id).await?;
        let message = self
            .store
            .create_message(PendingMessage::new(
                conversation.id,
                sender_id,
                content,
                Utc::now().trunc_subsecs(6),
            ))
            .await?;

        // Live clients in the room see REST-originated messages too.
        let event = WsMessage::ReceiveMessage(ReceiveMessagePayload::stored(&message, sender));
        let delivered = self.ws_manager.broadcast_to_room(conversation.id, &event, None);

        tracing::debug!(
            message_id = %message.id,
            conversation_id = %conversation.id,
            delivered,
            "message stored"
        );

        Ok(message)
    }

    pub async fn get_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageWithSender>> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Conversation not found".to_string()))?;

        self.store.find_messages(conversation_id).await
    }

    pub async fn mark_read(&self, message_id: Uuid) -> Result<Message> {
        self.store
            .mark_read(message_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Message not found".to_string()))
    }

    pub async fn get_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        self.store.list_user_conversations(user_id).await
    }
}
