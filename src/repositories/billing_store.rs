use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{BillingRecord, UsageLog, UsageSummary};

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn insert(&self, row: &UsageLog) -> StoreResult<()>;
    /// Aggregate counters for one key's rows since `since`.
    async fn summarize_for_key(
        &self,
        api_key_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<UsageSummary>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn insert(&self, record: &BillingRecord) -> StoreResult<()>;
    /// Balance debit plus ledger insert on the same backing connection.
    /// `new_balance` is the absolute target value computed under the
    /// caller's billing lock.
    async fn debit_and_record(
        &self,
        user_id: Uuid,
        new_balance: Decimal,
        record: &BillingRecord,
    ) -> StoreResult<()>;
}

pub struct PgUsageLogStore {
    pool: PgPool,
}

impl PgUsageLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLogStore for PgUsageLogStore {
    async fn insert(&self, row: &UsageLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_logs
                (id, user_id, api_key_id, provider_id, model_id, request_id,
                 method, endpoint, input_tokens, output_tokens, request_bytes,
                 response_bytes, duration_ms, status_code, cost, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(row.id)
        .bind(row.user_id)
        .bind(row.api_key_id)
        .bind(row.provider_id)
        .bind(row.model_id)
        .bind(row.request_id)
        .bind(&row.method)
        .bind(&row.endpoint)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.request_bytes)
        .bind(row.response_bytes)
        .bind(row.duration_ms)
        .bind(row.status_code)
        .bind(row.cost)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn summarize_for_key(
        &self,
        api_key_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS requests,
                   COALESCE(SUM(input_tokens), 0)::BIGINT AS input_tokens,
                   COALESCE(SUM(output_tokens), 0)::BIGINT AS output_tokens,
                   COALESCE(SUM(cost), 0) AS total_cost
            FROM usage_logs
            WHERE api_key_id = $1 AND created_at >= $2
            "#,
        )
        .bind(api_key_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSummary {
            requests: row.try_get("requests")?,
            input_tokens: row.try_get("input_tokens")?,
            output_tokens: row.try_get("output_tokens")?,
            total_cost: row.try_get("total_cost")?,
        })
    }
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    record: &'q BillingRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.usage_log_id)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(record.billing_type)
        .bind(record.status)
        .bind(&record.description)
        .bind(record.processed_at)
        .bind(record.created_at)
}

const INSERT_RECORD: &str = r#"
    INSERT INTO billing_records
        (id, user_id, usage_log_id, amount, currency, billing_type, status,
         description, processed_at, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert(&self, record: &BillingRecord) -> StoreResult<()> {
        bind_record(sqlx::query(INSERT_RECORD), record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn debit_and_record(
        &self,
        user_id: Uuid,
        new_balance: Decimal,
        record: &BillingRecord,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE users SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(user_id)
            .bind(new_balance)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }

        bind_record(sqlx::query(INSERT_RECORD), record)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
