use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One upstream AI service. `credential` is stored encrypted by the admin
/// plane; the dispatcher receives it decrypted. These rows serialize into
/// the in-process cache only, never onto an API response.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Provider {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub credential: String,
    pub status: ProviderStatus,
    pub health: ProviderHealth,
    /// Smaller is preferred.
    pub priority: i32,
    pub timeout_secs: i32,
    pub retry_attempts: i32,
    pub health_check_url: Option<String>,
    pub health_check_interval_secs: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    /// Eligible to receive traffic at all. Degraded providers stay eligible,
    /// they just sort behind healthy ones.
    pub fn is_dispatchable(&self) -> bool {
        self.status == ProviderStatus::Active && self.health != ProviderHealth::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Completion,
    Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Disabled,
}

/// A model slug the gateway serves. Models are catalog entries, not owned by
/// any provider; `ModelSupport` edges bind the two.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Model {
    pub id: Uuid,
    pub slug: String,
    pub display_name: Option<String>,
    pub model_type: ModelType,
    pub context_length: Option<i32>,
    pub max_tokens: Option<i32>,
    pub supports_streaming: bool,
    pub supports_functions: bool,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
}

/// Many-to-many edge between a provider and a model slug. Unique on
/// `(provider_id, model_slug)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelSupport {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub model_slug: String,
    /// Name the provider advertises the slug under, when it differs.
    pub upstream_model_name: Option<String>,
    pub enabled: bool,
    /// Smaller is preferred; ranks above the provider's own priority.
    pub priority: i32,
}

/// Join row handed to the router: a dispatchable provider plus the name the
/// model travels under on that provider's wire.
#[derive(Debug, Clone)]
pub struct SupportedProvider {
    pub provider: Provider,
    pub upstream_model_name: String,
    pub edge_priority: i32,
}
