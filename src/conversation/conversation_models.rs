use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }
}

/// Two distinct users in canonical order. `(a, b)` and `(b, a)` build the
/// same pair, and `first()` is what gets stored in `user1_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPair {
    low: Uuid,
    high: Uuid,
}

impl UserPair {
    pub fn new(a: Uuid, b: Uuid) -> Result<Self> {
        if a == b {
            return Err(AppError::BadRequest(
                "A conversation needs two different users".to_string(),
            ));
        }

        Ok(Self {
            low: a.min(b),
            high: a.max(b),
        })
    }

    pub fn first(&self) -> Uuid {
        self.low
    }

    pub fn second(&self) -> Uuid {
        self.high
    }
}

/// One row of a user's inbox: who the conversation is with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The other participant's id.
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub firstname: String,
    pub lastname: String,
    pub username: String,
    pub profile_image_url: Option<String>,
    pub bio: Option<String>,
}
