use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use super::user_models::PublicProfile;

/// Read-only view of the user service, as far as messaging is concerned.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_public_profile(&self, user_id: Uuid) -> Result<Option<PublicProfile>>;

    async fn exists(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.find_public_profile(user_id).await?.is_some())
    }
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for UserRepository {
    async fn find_public_profile(&self, user_id: Uuid) -> Result<Option<PublicProfile>> {
        let profile = sqlx::query_as::<_, PublicProfile>(
            "SELECT id, firstname, lastname, username, profile_image_url
             FROM users
             WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn exists(&self, user_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }
}
