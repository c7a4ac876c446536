//! Process-scoped wiring: one `AppState` holds the store handles, the cache
//! and lock substrates, and the composed services. Handlers receive it as
//! axum state; tests build it over in-memory stores.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::lock::LockService;
use crate::cache::CacheService;
use crate::config::AppConfig;
use crate::repositories::Repositories;
use crate::services::auth_service::AuthService;
use crate::services::billing_service::BillingService;
use crate::services::dispatch::AdapterRegistry;
use crate::services::pipeline::RequestPipeline;
use crate::services::quota_service::QuotaService;
use crate::services::quota_worker::QuotaConsumer;
use crate::services::router_service::RouterService;
use crate::services::tool_mediator::ToolMediator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repos: Repositories,
    pub cache: Arc<CacheService>,
    pub locks: Arc<LockService>,
    pub auth: Arc<AuthService>,
    pub pipeline: Arc<RequestPipeline>,
    pub consumer: Arc<QuotaConsumer>,
    pub registry: Arc<AdapterRegistry>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service from config + stores. Spawns the quota consumer
    /// pool; call `consumer.shutdown()` on exit to drain it.
    pub fn build(config: AppConfig, repos: Repositories, registry: AdapterRegistry) -> Self {
        let config = Arc::new(config);
        let cache = CacheService::new(config.cache.enabled);
        let locks = LockService::new();
        let registry = Arc::new(registry);

        let auth = Arc::new(AuthService::new(
            Arc::clone(&repos.api_keys),
            Arc::clone(&repos.users),
            Arc::clone(&cache),
            config.cache.api_key_ttl,
            config.cache.user_ttl,
        ));

        let quota = Arc::new(QuotaService::new(
            Arc::clone(&repos.quotas),
            Arc::clone(&repos.quota_usage),
            Arc::clone(&cache),
            config.cache.quota_ttl,
            config.cache.query_ttl,
        ));

        let consumer = QuotaConsumer::spawn(Arc::clone(&quota), config.async_quota.clone());

        let billing = Arc::new(BillingService::new(
            Arc::clone(&repos.users),
            Arc::clone(&repos.pricing),
            Arc::clone(&repos.billing),
            Arc::clone(&locks),
            Arc::clone(&cache),
            config.billing.clone(),
        ));

        let router = Arc::new(RouterService::new(
            Arc::clone(&repos.model_support),
            Arc::clone(&cache),
            config.cache.provider_ttl,
        ));

        let mediator = Arc::new(ToolMediator::new(config.function_call.clone()));

        let pipeline = Arc::new(RequestPipeline::new(
            quota,
            Arc::clone(&consumer),
            billing,
            router,
            Arc::clone(&repos.models),
            Arc::clone(&repos.usage_logs),
            Arc::clone(&registry),
            mediator,
            Arc::clone(&cache),
            config.cache.model_ttl,
        ));

        Self {
            config,
            repos,
            cache,
            locks,
            auth,
            pipeline,
            consumer,
            registry,
            started_at: Instant::now(),
        }
    }
}
