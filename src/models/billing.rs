use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingType {
    Usage,
    Credit,
    Refund,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    Pending,
    Processed,
    Failed,
}

/// Append-only ledger row. `status` transitions pending -> processed|failed
/// at most once; a reconciler drains the pending rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub usage_log_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_type: BillingType,
    pub status: BillingStatus,
    pub description: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BillingRecord {
    pub fn usage(
        user_id: Uuid,
        usage_log_id: Uuid,
        amount: Decimal,
        currency: &str,
        status: BillingStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            usage_log_id: Some(usage_log_id),
            amount,
            currency: currency.to_string(),
            billing_type: BillingType::Usage,
            status,
            description: None,
            processed_at: (status == BillingStatus::Processed).then_some(now),
            created_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One row per served request, appended once the upstream outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub api_key_id: Uuid,
    pub provider_id: Uuid,
    pub model_id: Uuid,
    pub request_id: Uuid,
    pub method: String,
    pub endpoint: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub duration_ms: i64,
    pub status_code: i32,
    pub cost: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Aggregate over a key's usage-log rows, served by `GET /v1/usage`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: Decimal,
}
