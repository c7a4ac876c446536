// ============================================================================
// Provider Router - Candidate Selection and Failover Ordering
// ============================================================================
//
// model-slug -> ordered candidate list. Primary order is the support edge's
// priority, then the provider's own priority, then id for a stable total
// order; soft-degraded providers sort behind everything healthy. The
// dispatcher walks the list and reports each attempt back, which drives the
// consecutive-failure degradation bookkeeping. The hard `unhealthy` status
// is written only by the out-of-band health checker.
//
// ============================================================================

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::{keys, CacheService};
use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::SupportedProvider;
use crate::repositories::ModelSupportStore;
use crate::services::dispatch::DispatchError;

/// Consecutive retryable failures within `window` before a provider is
/// soft-degraded.
const DEGRADE_THRESHOLD: u32 = 3;
const DEGRADE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: Uuid,
    pub provider_slug: String,
    pub base_url: String,
    pub credential: String,
    pub timeout: Duration,
    pub upstream_model_name: String,
    pub edge_priority: i32,
    pub provider_priority: i32,
}

impl Candidate {
    fn from_support(row: &SupportedProvider) -> Self {
        Self {
            provider_id: row.provider.id,
            provider_slug: row.provider.slug.clone(),
            base_url: row.provider.base_url.clone(),
            credential: row.provider.credential.clone(),
            timeout: Duration::from_secs(row.provider.timeout_secs.max(1) as u64),
            upstream_model_name: row.upstream_model_name.clone(),
            edge_priority: row.edge_priority,
            provider_priority: row.provider.priority,
        }
    }
}

#[derive(Debug, Default)]
struct FailureTally {
    consecutive: u32,
    last_failure: Option<Instant>,
}

pub struct RouterService {
    support: Arc<dyn ModelSupportStore>,
    cache: Arc<CacheService>,
    support_ttl: Duration,
    failures: DashMap<Uuid, FailureTally>,
}

impl RouterService {
    pub fn new(
        support: Arc<dyn ModelSupportStore>,
        cache: Arc<CacheService>,
        support_ttl: Duration,
    ) -> Self {
        Self { support, cache, support_ttl, failures: DashMap::new() }
    }

    /// Ordered candidates for a model slug. Empty means the model is known
    /// but currently unroutable; the caller maps that to
    /// `NoProviderAvailable`.
    pub async fn candidates(&self, model_slug: &str) -> Result<Vec<Candidate>> {
        let mut candidates = self.load_candidates(model_slug).await?;

        candidates.sort_by(|a, b| {
            self.is_degraded(a.provider_id)
                .cmp(&self.is_degraded(b.provider_id))
                .then(a.edge_priority.cmp(&b.edge_priority))
                .then(a.provider_priority.cmp(&b.provider_priority))
                .then(a.provider_id.cmp(&b.provider_id))
        });

        Ok(candidates)
    }

    async fn load_candidates(&self, model_slug: &str) -> Result<Vec<Candidate>> {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct CachedCandidate {
            provider_id: Uuid,
            provider_slug: String,
            base_url: String,
            credential: String,
            timeout_secs: u64,
            upstream_model_name: String,
            edge_priority: i32,
            provider_priority: i32,
        }

        let cache_key = keys::model_support(model_slug);
        if let Some(cached) = self.cache.get_json::<Vec<CachedCandidate>>(&cache_key) {
            return Ok(cached
                .into_iter()
                .map(|c| Candidate {
                    provider_id: c.provider_id,
                    provider_slug: c.provider_slug,
                    base_url: c.base_url,
                    credential: c.credential,
                    timeout: Duration::from_secs(c.timeout_secs),
                    upstream_model_name: c.upstream_model_name,
                    edge_priority: c.edge_priority,
                    provider_priority: c.provider_priority,
                })
                .collect());
        }

        let rows = self
            .support
            .get_supporting_providers(model_slug)
            .await
            .map_err(GatewayError::Store)?;
        let candidates: Vec<Candidate> = rows
            .iter()
            .filter(|row| row.provider.is_dispatchable())
            .map(Candidate::from_support)
            .collect();

        let cacheable: Vec<CachedCandidate> = candidates
            .iter()
            .map(|c| CachedCandidate {
                provider_id: c.provider_id,
                provider_slug: c.provider_slug.clone(),
                base_url: c.base_url.clone(),
                credential: c.credential.clone(),
                timeout_secs: c.timeout.as_secs(),
                upstream_model_name: c.upstream_model_name.clone(),
                edge_priority: c.edge_priority,
                provider_priority: c.provider_priority,
            })
            .collect();
        self.cache.set_json(&cache_key, &cacheable, self.support_ttl);

        Ok(candidates)
    }

    /// Retryable outcome: advance to the next candidate and count against
    /// the provider's degradation tally.
    pub fn record_failure(&self, provider_id: Uuid, error: &DispatchError) {
        if !error.is_retryable() {
            return;
        }
        let now = Instant::now();
        let mut tally = self.failures.entry(provider_id).or_default();
        let within_window = tally
            .last_failure
            .map(|at| now.duration_since(at) < DEGRADE_WINDOW)
            .unwrap_or(false);
        tally.consecutive = if within_window { tally.consecutive + 1 } else { 1 };
        tally.last_failure = Some(now);

        if tally.consecutive == DEGRADE_THRESHOLD {
            tracing::warn!(
                provider_id = %provider_id,
                failures = tally.consecutive,
                "provider soft-degraded after consecutive retryable failures"
            );
        }
    }

    /// A successful dispatch clears the tally; the provider sorts with the
    /// healthy set again.
    pub fn record_success(&self, provider_id: Uuid) {
        self.failures.remove(&provider_id);
    }

    pub fn is_degraded(&self, provider_id: Uuid) -> bool {
        self.failures
            .get(&provider_id)
            .map(|tally| {
                tally.consecutive >= DEGRADE_THRESHOLD
                    && tally
                        .last_failure
                        .map(|at| at.elapsed() < DEGRADE_WINDOW)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provider, ProviderHealth, ProviderStatus};
    use crate::repositories::StoreResult;
    use async_trait::async_trait;
    use chrono::Utc;

    fn provider(slug: &str, priority: i32, health: ProviderHealth) -> Provider {
        Provider {
            id: Uuid::new_v4(),
            slug: slug.into(),
            name: slug.into(),
            base_url: format!("https://{slug}.example/v1"),
            credential: "secret".into(),
            status: ProviderStatus::Active,
            health,
            priority,
            timeout_secs: 30,
            retry_attempts: 2,
            health_check_url: None,
            health_check_interval_secs: 60,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct MemSupport {
        rows: Vec<SupportedProvider>,
    }

    #[async_trait]
    impl ModelSupportStore for MemSupport {
        async fn get_supporting_providers(
            &self,
            _model_slug: &str,
        ) -> StoreResult<Vec<SupportedProvider>> {
            Ok(self.rows.clone())
        }
    }

    fn support(provider: Provider, edge_priority: i32) -> SupportedProvider {
        SupportedProvider {
            upstream_model_name: "upstream-m".into(),
            edge_priority,
            provider,
        }
    }

    fn router(rows: Vec<SupportedProvider>) -> RouterService {
        RouterService::new(
            Arc::new(MemSupport { rows }),
            CacheService::new(false),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn candidates_order_by_edge_then_provider_priority() {
        let p1 = provider("p1", 1, ProviderHealth::Healthy);
        let p2 = provider("p2", 2, ProviderHealth::Healthy);
        let p3 = provider("p3", 1, ProviderHealth::Healthy);
        let router = router(vec![
            support(p2.clone(), 2),
            support(p1.clone(), 1),
            support(p3.clone(), 2),
        ]);

        let candidates = router.candidates("m").await.unwrap();
        assert_eq!(candidates[0].provider_id, p1.id);
        // Same edge priority: provider priority breaks the tie.
        assert_eq!(candidates[1].provider_id, p3.id);
        assert_eq!(candidates[2].provider_id, p2.id);
    }

    #[tokio::test]
    async fn unhealthy_providers_are_excluded() {
        let p1 = provider("p1", 1, ProviderHealth::Unhealthy);
        let p2 = provider("p2", 2, ProviderHealth::Healthy);
        let router = router(vec![support(p1, 1), support(p2.clone(), 2)]);

        let candidates = router.candidates("m").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_id, p2.id);
    }

    #[tokio::test]
    async fn degraded_provider_sorts_last_and_recovers() {
        let p1 = provider("p1", 1, ProviderHealth::Healthy);
        let p2 = provider("p2", 2, ProviderHealth::Healthy);
        let router = router(vec![support(p1.clone(), 1), support(p2.clone(), 2)]);

        for _ in 0..DEGRADE_THRESHOLD {
            router.record_failure(
                p1.id,
                &DispatchError::UpstreamStatus { status: 500, body: String::new() },
            );
        }
        assert!(router.is_degraded(p1.id));

        let candidates = router.candidates("m").await.unwrap();
        assert_eq!(candidates[0].provider_id, p2.id);
        assert_eq!(candidates[1].provider_id, p1.id);

        router.record_success(p1.id);
        assert!(!router.is_degraded(p1.id));
        let candidates = router.candidates("m").await.unwrap();
        assert_eq!(candidates[0].provider_id, p1.id);
    }

    #[tokio::test]
    async fn fatal_outcomes_do_not_count_toward_degradation() {
        let p1 = provider("p1", 1, ProviderHealth::Healthy);
        let router = router(vec![support(p1.clone(), 1)]);

        for _ in 0..10 {
            router.record_failure(
                p1.id,
                &DispatchError::UpstreamStatus { status: 400, body: String::new() },
            );
        }
        assert!(!router.is_degraded(p1.id));
    }
}
