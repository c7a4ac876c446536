//! Providers, models, support edges, and pricing: the read-mostly catalog
//! the router and billing engine consult.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{Model, ModelPricing, PricingType, Provider, SupportedProvider};

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<Provider>;
    /// Providers eligible for traffic: `status = active`, `health != unhealthy`.
    async fn list_available(&self) -> StoreResult<Vec<Provider>>;
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Model>;
    async fn list_active(&self) -> StoreResult<Vec<Model>>;
}

#[async_trait]
pub trait ModelSupportStore: Send + Sync {
    /// Dispatchable providers advertising `model_slug`, ordered by
    /// `(edge.priority asc, provider.priority asc, provider.id)`.
    async fn get_supporting_providers(&self, model_slug: &str)
        -> StoreResult<Vec<SupportedProvider>>;
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    /// The single pricing row current for `(model, type)` at `at`.
    async fn current(
        &self,
        model_id: Uuid,
        pricing_type: PricingType,
        at: DateTime<Utc>,
    ) -> StoreResult<ModelPricing>;
}

pub struct PgProviderStore {
    pool: PgPool,
}

impl PgProviderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PROVIDER_COLUMNS: &str = "id, slug, name, base_url, credential, status, health, priority, \
     timeout_secs, retry_attempts, health_check_url, health_check_interval_secs, \
     created_at, updated_at";

#[async_trait]
impl ProviderStore for PgProviderStore {
    async fn get_by_id(&self, id: Uuid) -> StoreResult<Provider> {
        sqlx::query_as::<_, Provider>(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn list_available(&self) -> StoreResult<Vec<Provider>> {
        sqlx::query_as::<_, Provider>(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers \
             WHERE status = 'active' AND health <> 'unhealthy' \
             ORDER BY priority, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }
}

pub struct PgModelStore {
    pool: PgPool,
}

impl PgModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MODEL_COLUMNS: &str = "id, slug, display_name, model_type, context_length, max_tokens, \
     supports_streaming, supports_functions, status, created_at";

#[async_trait]
impl ModelStore for PgModelStore {
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Model> {
        sqlx::query_as::<_, Model>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn list_active(&self) -> StoreResult<Vec<Model>> {
        sqlx::query_as::<_, Model>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE status = 'active' ORDER BY slug"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }
}

pub struct PgModelSupportStore {
    pool: PgPool,
}

impl PgModelSupportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelSupportStore for PgModelSupportStore {
    async fn get_supporting_providers(
        &self,
        model_slug: &str,
    ) -> StoreResult<Vec<SupportedProvider>> {
        let rows = sqlx::query(&format!(
            "SELECT s.priority AS edge_priority, s.upstream_model_name, s.model_slug, \
                    {}
             FROM provider_model_support s
             JOIN providers p ON p.id = s.provider_id
             WHERE s.model_slug = $1
               AND s.enabled
               AND p.status = 'active'
               AND p.health <> 'unhealthy'
             ORDER BY s.priority, p.priority, p.id",
            PROVIDER_COLUMNS
                .split(", ")
                .map(|c| format!("p.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(model_slug)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let provider = Provider {
                    id: row.try_get("id")?,
                    slug: row.try_get("slug")?,
                    name: row.try_get("name")?,
                    base_url: row.try_get("base_url")?,
                    credential: row.try_get("credential")?,
                    status: row.try_get("status")?,
                    health: row.try_get("health")?,
                    priority: row.try_get("priority")?,
                    timeout_secs: row.try_get("timeout_secs")?,
                    retry_attempts: row.try_get("retry_attempts")?,
                    health_check_url: row.try_get("health_check_url")?,
                    health_check_interval_secs: row.try_get("health_check_interval_secs")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                };
                let upstream: Option<String> = row.try_get("upstream_model_name")?;
                let slug: String = row.try_get("model_slug")?;
                Ok(SupportedProvider {
                    upstream_model_name: upstream.unwrap_or(slug),
                    edge_priority: row.try_get("edge_priority")?,
                    provider,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

pub struct PgPricingStore {
    pool: PgPool,
}

impl PgPricingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PricingStore for PgPricingStore {
    async fn current(
        &self,
        model_id: Uuid,
        pricing_type: PricingType,
        at: DateTime<Utc>,
    ) -> StoreResult<ModelPricing> {
        sqlx::query_as::<_, ModelPricing>(
            r#"
            SELECT id, model_id, pricing_type, price_per_unit, unit, currency,
                   effective_from, effective_until
            FROM model_pricing
            WHERE model_id = $1
              AND pricing_type = $2
              AND effective_from <= $3
              AND (effective_until IS NULL OR effective_until > $3)
            ORDER BY effective_from DESC
            LIMIT 1
            "#,
        )
        .bind(model_id)
        .bind(pricing_type)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }
}
