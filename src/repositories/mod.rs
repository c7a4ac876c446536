// ============================================================================
// Repository Facade - Narrow Store Contracts
// ============================================================================
//
// One trait per collection, carrying exactly the operations the request
// lifecycle consumes. Not-found is a distinct error, never an empty result.
// Write methods are atomic for one row; the single multi-row atomicity the
// core relies on is `BillingStore::debit_and_record` (same transaction).
//
// ============================================================================

pub mod api_key_store;
pub mod billing_store;
pub mod catalog_store;
pub mod quota_store;
pub mod schema;
pub mod user_store;

pub use api_key_store::*;
pub use billing_store::*;
pub use catalog_store::*;
pub use quota_store::*;
pub use user_store::*;

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Map sqlx's row-not-found into the facade's distinct error.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other),
        }
    }
}

/// Liveness probe against the backing store, used by the health surface.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;
}

pub struct PgHealthProbe {
    pool: PgPool,
}

#[async_trait]
impl HealthProbe for PgHealthProbe {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Bundle of store handles the services are constructed from. All trait
/// objects so the test suite can swap in in-memory implementations.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub providers: Arc<dyn ProviderStore>,
    pub models: Arc<dyn ModelStore>,
    pub model_support: Arc<dyn ModelSupportStore>,
    pub pricing: Arc<dyn PricingStore>,
    pub quotas: Arc<dyn QuotaStore>,
    pub quota_usage: Arc<dyn QuotaUsageStore>,
    pub usage_logs: Arc<dyn UsageLogStore>,
    pub billing: Arc<dyn BillingStore>,
    pub probe: Arc<dyn HealthProbe>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(PgUserStore::new(pool.clone())),
            api_keys: Arc::new(PgApiKeyStore::new(pool.clone())),
            providers: Arc::new(PgProviderStore::new(pool.clone())),
            models: Arc::new(PgModelStore::new(pool.clone())),
            model_support: Arc::new(PgModelSupportStore::new(pool.clone())),
            pricing: Arc::new(PgPricingStore::new(pool.clone())),
            quotas: Arc::new(PgQuotaStore::new(pool.clone())),
            quota_usage: Arc::new(PgQuotaUsageStore::new(pool.clone())),
            usage_logs: Arc::new(PgUsageLogStore::new(pool.clone())),
            billing: Arc::new(PgBillingStore::new(pool.clone())),
            probe: Arc::new(PgHealthProbe { pool }),
        }
    }
}
