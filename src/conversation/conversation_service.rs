use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use super::{
    conversation_models::{Conversation, UserPair},
    conversation_repository::ConversationStore,
};

/// Maps an unordered pair of users to their single conversation.
#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn ConversationStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Returns the conversation between `user_a` and `user_b`, creating it on
    /// first use. Argument order does not matter.
    pub async fn resolve_or_create(&self, user_a: Uuid, user_b: Uuid) -> Result<Conversation> {
        let pair = UserPair::new(user_a, user_b)?;
        let conversation = self.store.find_or_create_conversation(pair).await?;

        tracing::debug!(
            conversation_id = %conversation.id,
            user1_id = %conversation.user1_id,
            user2_id = %conversation.user2_id,
            "conversation resolved"
        );

        Ok(conversation)
    }
}
