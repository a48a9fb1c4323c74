use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::Result,
    middleware::AuthUser,
    state::AppState,
    message::message_dto::SendMessageRequest,
};

/// Send a message, persisting it immediately
#[utoipa::path(
    post,
    path = "/api/messages/send",
    tag = "messages",
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored", body = crate::message::message_models::Message),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Sender not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let message = state
        .message_service
        .send_message(payload.sender_id, user_id, payload.content)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Get all conversations of the authenticated user
#[utoipa::path(
    get,
    path = "/api/messages/get-conversations",
    tag = "messages",
    responses(
        (status = 200, description = "Conversations with the other participant's profile", body = Vec<crate::conversation::ConversationSummary>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse> {
    let conversations = state.message_service.get_conversations(user_id).await?;

    Ok((StatusCode::OK, Json(conversations)))
}

/// Get every message of a conversation, oldest first
#[utoipa::path(
    get,
    path = "/api/messages/conversation/{conversation_id}",
    tag = "messages",
    params(
        ("conversation_id" = Uuid, Path, description = "Conversation ID")
    ),
    responses(
        (status = 200, description = "Messages with sender profiles", body = Vec<crate::message::message_models::MessageWithSender>),
        (status = 404, description = "Conversation not found")
    )
)]
pub async fn get_conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let messages = state.message_service.get_messages(conversation_id).await?;

    Ok((StatusCode::OK, Json(messages)))
}

/// Mark a message as read
#[utoipa::path(
    patch,
    path = "/api/messages/receive/{message_id}",
    tag = "messages",
    params(
        ("message_id" = Uuid, Path, description = "Message ID to mark as read")
    ),
    responses(
        (status = 200, description = "Message marked as read", body = crate::message::message_models::Message),
        (status = 404, description = "Message not found")
    )
)]
pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let message = state.message_service.mark_read(message_id).await?;

    Ok((StatusCode::OK, Json(message)))
}
