use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::User;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<User>;
    async fn get_by_username(&self, username: &str) -> StoreResult<User>;
    async fn get_by_email(&self, email: &str) -> StoreResult<User>;
    /// Idempotent on `new_balance`: callers compute the target value under
    /// the billing lock and write it absolutely.
    async fn update_balance(&self, id: Uuid, new_balance: Decimal) -> StoreResult<()>;
    async fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        email: Option<&str>,
    ) -> StoreResult<()>;
}

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, status, balance, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn get_by_username(&self, username: &str) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, status, balance, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, status, balance, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn update_balance(&self, id: Uuid, new_balance: Decimal) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET balance = $2, updated_at = $3 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_balance)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        email: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET username = COALESCE($2, username),
                email = COALESCE($3, email),
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(email)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
