use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PricingType {
    Input,
    Output,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PricingUnit {
    Token,
    Request,
    Character,
}

/// One pricing row for a `(model, type)` pair. For any wall-clock instant
/// exactly one row is current: `effective_from <= t < effective_until`.
/// Token prices are quoted per 1000 tokens.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelPricing {
    pub id: Uuid,
    pub model_id: Uuid,
    pub pricing_type: PricingType,
    pub price_per_unit: Decimal,
    pub unit: PricingUnit,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
}

impl ModelPricing {
    pub fn is_current_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_until.map_or(true, |until| at < until)
    }
}
