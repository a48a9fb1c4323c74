pub mod conversation_models;
pub mod conversation_repository;
pub mod conversation_service;

pub use conversation_models::{Conversation, ConversationSummary, UserPair};
pub use conversation_repository::{ConversationRepository, ConversationStore};
pub use conversation_service::ConversationResolver;
