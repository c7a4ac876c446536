use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{Quota, QuotaPeriod, QuotaType, QuotaUsage, Scope, Window};

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn list_for_scope(&self, scope: &Scope) -> StoreResult<Vec<Quota>>;
    async fn get_by_scope_type_period(
        &self,
        scope: &Scope,
        quota_type: QuotaType,
        period: QuotaPeriod,
    ) -> StoreResult<Quota>;
}

#[async_trait]
pub trait QuotaUsageStore: Send + Sync {
    async fn get_for_window(
        &self,
        scope: &Scope,
        quota_id: Uuid,
        window: &Window,
    ) -> StoreResult<QuotaUsage>;

    /// Atomic upsert: creates the window row if absent, otherwise adds
    /// `delta` in place. Never a read-modify-write from the application.
    async fn increment(
        &self,
        scope: &Scope,
        quota_id: Uuid,
        delta: Decimal,
        window: &Window,
    ) -> StoreResult<()>;
}

pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const QUOTA_COLUMNS: &str =
    "id, scope_kind, scope_id, quota_type, period, limit_value, status, created_at";

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn list_for_scope(&self, scope: &Scope) -> StoreResult<Vec<Quota>> {
        sqlx::query_as::<_, Quota>(&format!(
            "SELECT {QUOTA_COLUMNS} FROM quotas \
             WHERE scope_kind = $1 AND scope_id = $2 \
             ORDER BY created_at"
        ))
        .bind(scope.kind)
        .bind(scope.id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn get_by_scope_type_period(
        &self,
        scope: &Scope,
        quota_type: QuotaType,
        period: QuotaPeriod,
    ) -> StoreResult<Quota> {
        sqlx::query_as::<_, Quota>(&format!(
            "SELECT {QUOTA_COLUMNS} FROM quotas \
             WHERE scope_kind = $1 AND scope_id = $2 AND quota_type = $3 AND period = $4"
        ))
        .bind(scope.kind)
        .bind(scope.id)
        .bind(quota_type)
        .bind(period)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }
}

pub struct PgQuotaUsageStore {
    pool: PgPool,
}

impl PgQuotaUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaUsageStore for PgQuotaUsageStore {
    async fn get_for_window(
        &self,
        scope: &Scope,
        quota_id: Uuid,
        window: &Window,
    ) -> StoreResult<QuotaUsage> {
        sqlx::query_as::<_, QuotaUsage>(
            r#"
            SELECT id, scope_kind, scope_id, quota_id, period_start, period_end,
                   used_value, updated_at
            FROM quota_usage
            WHERE scope_kind = $1
              AND scope_id = $2
              AND quota_id = $3
              AND period_start IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(scope.kind)
        .bind(scope.id)
        .bind(quota_id)
        .bind(window.start)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn increment(
        &self,
        scope: &Scope,
        quota_id: Uuid,
        delta: Decimal,
        window: &Window,
    ) -> StoreResult<()> {
        // The conflict target is the expression index created in schema.rs;
        // NULL window starts collapse onto -infinity so running caps share
        // one row.
        sqlx::query(
            r#"
            INSERT INTO quota_usage
                (id, scope_kind, scope_id, quota_id, period_start, period_end,
                 used_value, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (scope_kind, scope_id, quota_id,
                         COALESCE(period_start, '-infinity'::timestamptz))
            DO UPDATE SET
                used_value = quota_usage.used_value + EXCLUDED.used_value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope.kind)
        .bind(scope.id)
        .bind(quota_id)
        .bind(window.start)
        .bind(window.end)
        .bind(delta)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
