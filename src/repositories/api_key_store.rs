use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::ApiKey;

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<ApiKey>;
    async fn get_by_key(&self, key: &str) -> StoreResult<ApiKey>;
    async fn list_active_by_user(&self, user_id: Uuid) -> StoreResult<Vec<ApiKey>>;
    /// Best-effort bookkeeping; callers fire-and-forget this.
    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

pub struct PgApiKeyStore {
    pool: PgPool,
}

impl PgApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str =
    "id, user_id, key, key_prefix, status, permissions, expires_at, last_used_at, created_at";

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<ApiKey> {
        sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {COLUMNS} FROM api_keys WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn get_by_key(&self, key: &str) -> StoreResult<ApiKey> {
        sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {COLUMNS} FROM api_keys WHERE key = $1"
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {COLUMNS} FROM api_keys WHERE user_id = $1 AND status = 'active' ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
