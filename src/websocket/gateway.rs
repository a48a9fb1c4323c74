//! Realtime operations behind the socket: rooms, conversation resolution and
//! live messages. Replies and errors travel back over the caller's own
//! connection; nothing here ever closes a socket.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    conversation::{ConversationResolver, ConversationStore},
    error::AppError,
    message::{check_content, message_models::PendingMessage, message_queue::MessageQueue},
    user::UserDirectory,
};
use super::{
    connection::{ConnectionId, ConnectionManager},
    types::{
        CreateConversationReplyPayload, CreateConversationRequest, ErrorPayload,
        ReceiveMessagePayload, SendMessageEvent, WsMessage,
    },
};

#[derive(Clone)]
pub struct Gateway {
    connections: ConnectionManager,
    resolver: ConversationResolver,
    store: Arc<dyn ConversationStore>,
    users: Arc<dyn UserDirectory>,
    queue: MessageQueue,
}

impl Gateway {
    pub fn new(
        connections: ConnectionManager,
        resolver: ConversationResolver,
        store: Arc<dyn ConversationStore>,
        users: Arc<dyn UserDirectory>,
        queue: MessageQueue,
    ) -> Self {
        Self {
            connections,
            resolver,
            store,
            users,
            queue,
        }
    }

    fn reply_error(&self, connection_id: ConnectionId, message: impl Into<String>) {
        self.connections.send_to_connection(
            connection_id,
            WsMessage::Error(ErrorPayload {
                message: message.into(),
            }),
        );
    }

    /// The authenticated user of the connection must be the one acting.
    fn check_acting_user(&self, connection_id: ConnectionId, claimed: Uuid) -> bool {
        if self.connections.user_of(connection_id) == Some(claimed) {
            return true;
        }
        tracing::warn!(%connection_id, %claimed, "sender does not match authenticated user");
        self.reply_error(connection_id, "senderId does not match the authenticated user");
        false
    }

    pub fn join_room(&self, connection_id: ConnectionId, room_id: Uuid) {
        if self.connections.join_room(connection_id, room_id) {
            tracing::debug!(
                %connection_id,
                %room_id,
                members = self.connections.room_size(room_id),
                "joined room"
            );
        }
    }

    /// Replies with the conversation id exactly once on success. A storage
    /// failure produces no reply at all.
    pub async fn resolve_or_create_conversation(
        &self,
        connection_id: ConnectionId,
        request: CreateConversationRequest,
    ) {
        if !self.check_acting_user(connection_id, request.sender_id) {
            return;
        }

        match self
            .resolver
            .resolve_or_create(request.sender_id, request.user_id)
            .await
        {
            Ok(conversation) => {
                self.connections.send_to_connection(
                    connection_id,
                    WsMessage::CreateConversationReply(CreateConversationReplyPayload {
                        ack_id: request.ack_id,
                        conversation_id: conversation.id,
                    }),
                );
            }
            Err(AppError::BadRequest(message)) => self.reply_error(connection_id, message),
            Err(e) => {
                tracing::error!(
                    %connection_id,
                    user_id = %request.user_id,
                    sender_id = %request.sender_id,
                    error = %e,
                    "failed to resolve conversation"
                );
            }
        }
    }

    /// Accepts a live message: enqueues it for persistence and fans it out to
    /// the conversation room, without waiting for the store.
    pub async fn send_message(&self, connection_id: ConnectionId, event: SendMessageEvent) {
        let SendMessageEvent {
            conversation_id,
            message: content,
            sender_id,
        } = event;

        if let Err(e) = check_content(&content) {
            self.reply_error(connection_id, e.public_message());
            return;
        }
        if !self.check_acting_user(connection_id, sender_id) {
            return;
        }

        let record = PendingMessage::new(conversation_id, sender_id, content, Utc::now());

        match self.store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) if conversation.has_participant(sender_id) => {}
            Ok(Some(_)) => {
                self.reply_error(connection_id, "Not a participant of this conversation");
                return;
            }
            Ok(None) => {
                self.reply_error(connection_id, "Conversation not found");
                return;
            }
            Err(e) => {
                tracing::error!(%conversation_id, error = %e, "failed to load conversation");
                return;
            }
        }

        let sender = match self.users.find_public_profile(sender_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(%sender_id, %conversation_id, "sender profile not found, message dropped");
                return;
            }
            Err(e) => {
                tracing::error!(%sender_id, error = %e, "sender profile lookup failed, message dropped");
                return;
            }
        };

        let connections = &self.connections;
        self.queue.enqueue_with(record, |queued| {
            let event = WsMessage::ReceiveMessage(ReceiveMessagePayload::queued(queued, sender));
            let delivered = connections.broadcast_to_room(conversation_id, &event, Some(connection_id));
            tracing::debug!(%conversation_id, %sender_id, delivered, "message broadcast");
        });
    }
}
