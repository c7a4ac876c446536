// ============================================================================
// Quota Engine - Check Before Admit, Atomic Consume
// ============================================================================
//
// Periodic quotas account against the minimal aligned window containing now
// (models::QuotaPeriod::window_at); `period = none` is a running cap with a
// single unbounded row. Absence of quotas for a scope means no cap.
//
// Checks read through the cache with a short TTL; consumption goes through
// the store's atomic increment and then invalidates the scope's usage
// entries by prefix. Denied requests do not consume.
//
// ============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{keys, CacheService};
use crate::middleware::error_handling::QuotaDenial;
use crate::models::{Quota, QuotaType, QuotaUsage, Scope};
use crate::repositories::{QuotaStore, QuotaUsageStore, StoreError, StoreResult};

/// Outcome of an admission check for one `(scope, quota_type)` dimension.
#[derive(Debug, Clone)]
pub enum QuotaDecision {
    /// No matching quota, or headroom on every matching quota. The standing
    /// reports the tightest dimension for the response headers.
    Allowed(Option<QuotaStanding>),
    Denied(QuotaDenial),
}

#[derive(Debug, Clone)]
pub struct QuotaStanding {
    pub limit: Decimal,
    pub used: Decimal,
    pub remaining: Decimal,
    pub reset_at: Option<chrono::DateTime<Utc>>,
}

pub struct QuotaService {
    quotas: Arc<dyn QuotaStore>,
    usage: Arc<dyn QuotaUsageStore>,
    cache: Arc<CacheService>,
    quota_ttl: Duration,
    usage_ttl: Duration,
}

impl QuotaService {
    pub fn new(
        quotas: Arc<dyn QuotaStore>,
        usage: Arc<dyn QuotaUsageStore>,
        cache: Arc<CacheService>,
        quota_ttl: Duration,
        usage_ttl: Duration,
    ) -> Self {
        Self { quotas, usage, cache, quota_ttl, usage_ttl }
    }

    pub async fn check(
        &self,
        scope: &Scope,
        quota_type: QuotaType,
        amount: Decimal,
    ) -> StoreResult<QuotaDecision> {
        let quotas = self.load_quotas(scope).await?;
        let mut tightest: Option<QuotaStanding> = None;

        for quota in quotas.iter().filter(|q| q.is_active() && q.quota_type == quota_type) {
            let window = quota.period.window_at(Utc::now());
            let used = self.load_used(scope, quota, &window).await?;

            if used + amount > quota.limit_value {
                return Ok(QuotaDecision::Denied(QuotaDenial {
                    scope: *scope,
                    quota_type,
                    period: quota.period,
                    limit: quota.limit_value,
                    used,
                    reset_at: window.end,
                }));
            }

            let standing = QuotaStanding {
                limit: quota.limit_value,
                used,
                remaining: quota.limit_value - used - amount,
                reset_at: window.end,
            };
            let tighter = tightest
                .as_ref()
                .map(|t| standing.remaining < t.remaining)
                .unwrap_or(true);
            if tighter {
                tightest = Some(standing);
            }
        }

        Ok(QuotaDecision::Allowed(tightest))
    }

    /// Commit `amount` against every matching active quota. Called from the
    /// consumer workers, and inline when the consumer channel is full.
    pub async fn consume(
        &self,
        scope: &Scope,
        quota_type: QuotaType,
        amount: Decimal,
    ) -> StoreResult<()> {
        let quotas = self.load_quotas(scope).await?;
        let mut touched = false;

        for quota in quotas.iter().filter(|q| q.is_active() && q.quota_type == quota_type) {
            let window = quota.period.window_at(Utc::now());
            self.usage.increment(scope, quota.id, amount, &window).await?;
            touched = true;
        }

        if touched {
            self.cache.delete_prefix(&keys::quota_usage_scope_prefix(scope));
        }
        Ok(())
    }

    async fn load_quotas(&self, scope: &Scope) -> StoreResult<Vec<Quota>> {
        let cache_key = keys::scope_quotas(scope);
        if let Some(cached) = self.cache.get_json::<Vec<Quota>>(&cache_key) {
            return Ok(cached);
        }
        let quotas = self.quotas.list_for_scope(scope).await?;
        self.cache.set_json(&cache_key, &quotas, self.quota_ttl);
        Ok(quotas)
    }

    async fn load_used(
        &self,
        scope: &Scope,
        quota: &Quota,
        window: &crate::models::Window,
    ) -> StoreResult<Decimal> {
        let cache_key = keys::quota_usage(scope, quota.id, window);
        if let Some(used) = self.cache.get_json::<Decimal>(&cache_key) {
            return Ok(used);
        }
        let used = match self.usage.get_for_window(scope, quota.id, window).await {
            Ok(QuotaUsage { used_value, .. }) => used_value,
            Err(StoreError::NotFound) => Decimal::ZERO,
            Err(e) => return Err(e),
        };
        self.cache.set_json(&cache_key, &used, self.usage_ttl);
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuotaPeriod, QuotaStatus, Window};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[derive(Default)]
    struct MemQuotas {
        rows: DashMap<Uuid, Quota>,
    }

    #[async_trait]
    impl QuotaStore for MemQuotas {
        async fn list_for_scope(&self, scope: &Scope) -> StoreResult<Vec<Quota>> {
            Ok(self
                .rows
                .iter()
                .filter(|e| e.value().scope() == *scope)
                .map(|e| e.value().clone())
                .collect())
        }
        async fn get_by_scope_type_period(
            &self,
            scope: &Scope,
            quota_type: QuotaType,
            period: QuotaPeriod,
        ) -> StoreResult<Quota> {
            self.rows
                .iter()
                .find(|e| {
                    let q = e.value();
                    q.scope() == *scope && q.quota_type == quota_type && q.period == period
                })
                .map(|e| e.value().clone())
                .ok_or(StoreError::NotFound)
        }
    }

    #[derive(Default)]
    struct MemUsage {
        rows: DashMap<(Uuid, String), QuotaUsage>,
    }

    #[async_trait]
    impl QuotaUsageStore for MemUsage {
        async fn get_for_window(
            &self,
            _scope: &Scope,
            quota_id: Uuid,
            window: &Window,
        ) -> StoreResult<QuotaUsage> {
            self.rows
                .get(&(quota_id, window.period_key()))
                .map(|e| e.clone())
                .ok_or(StoreError::NotFound)
        }
        async fn increment(
            &self,
            scope: &Scope,
            quota_id: Uuid,
            delta: Decimal,
            window: &Window,
        ) -> StoreResult<()> {
            self.rows
                .entry((quota_id, window.period_key()))
                .and_modify(|row| {
                    row.used_value += delta;
                    row.updated_at = Utc::now();
                })
                .or_insert_with(|| QuotaUsage {
                    id: Uuid::new_v4(),
                    scope_kind: scope.kind,
                    scope_id: scope.id,
                    quota_id,
                    period_start: window.start,
                    period_end: window.end,
                    used_value: delta,
                    updated_at: Utc::now(),
                });
            Ok(())
        }
    }

    fn quota(scope: Scope, quota_type: QuotaType, period: QuotaPeriod, limit: Decimal) -> Quota {
        Quota {
            id: Uuid::new_v4(),
            scope_kind: scope.kind,
            scope_id: scope.id,
            quota_type,
            period,
            limit_value: limit,
            status: QuotaStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn service() -> (QuotaService, Arc<MemQuotas>, Arc<MemUsage>) {
        let quotas = Arc::new(MemQuotas::default());
        let usage = Arc::new(MemUsage::default());
        let service = QuotaService::new(
            quotas.clone(),
            usage.clone(),
            CacheService::new(true),
            Duration::from_secs(60),
            // Zero usage TTL: every check reads the store, so serial
            // admission is exact.
            Duration::ZERO,
        );
        (service, quotas, usage)
    }

    #[tokio::test]
    async fn absence_of_quotas_means_no_cap() {
        let (service, _, _) = service();
        let scope = Scope::api_key(Uuid::new_v4());
        match service.check(&scope, QuotaType::Requests, dec!(1)).await.unwrap() {
            QuotaDecision::Allowed(None) => {}
            other => panic!("expected unconditional allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn serial_consumption_denies_at_limit() {
        let (service, quotas, _) = service();
        let scope = Scope::api_key(Uuid::new_v4());
        let q = quota(scope, QuotaType::Requests, QuotaPeriod::Minute, dec!(3));
        quotas.rows.insert(q.id, q);

        for _ in 0..3 {
            match service.check(&scope, QuotaType::Requests, dec!(1)).await.unwrap() {
                QuotaDecision::Allowed(_) => {}
                QuotaDecision::Denied(d) => panic!("denied early: {d:?}"),
            }
            service.consume(&scope, QuotaType::Requests, dec!(1)).await.unwrap();
        }

        match service.check(&scope, QuotaType::Requests, dec!(1)).await.unwrap() {
            QuotaDecision::Denied(denial) => {
                assert_eq!(denial.limit, dec!(3));
                assert_eq!(denial.used, dec!(3));
                assert_eq!(denial.remaining(), dec!(0));
                assert!(denial.reset_at.is_some());
            }
            QuotaDecision::Allowed(_) => panic!("over-admitted"),
        }
    }

    #[tokio::test]
    async fn running_cap_never_resets() {
        let (service, quotas, _) = service();
        let scope = Scope::user(Uuid::new_v4());
        let q = quota(scope, QuotaType::Cost, QuotaPeriod::None, dec!(10));
        quotas.rows.insert(q.id, q);

        service.consume(&scope, QuotaType::Cost, dec!(9)).await.unwrap();

        match service.check(&scope, QuotaType::Cost, dec!(2)).await.unwrap() {
            QuotaDecision::Denied(denial) => {
                assert_eq!(denial.reset_at, None);
                assert_eq!(denial.used, dec!(9));
            }
            QuotaDecision::Allowed(_) => panic!("running cap ignored"),
        }
        // Still room for a smaller amount.
        assert!(matches!(
            service.check(&scope, QuotaType::Cost, dec!(1)).await.unwrap(),
            QuotaDecision::Allowed(Some(_))
        ));
    }

    #[tokio::test]
    async fn disabled_quotas_are_ignored() {
        let (service, quotas, _) = service();
        let scope = Scope::api_key(Uuid::new_v4());
        let mut q = quota(scope, QuotaType::Requests, QuotaPeriod::Minute, dec!(0));
        q.status = QuotaStatus::Disabled;
        quotas.rows.insert(q.id, q);

        assert!(matches!(
            service.check(&scope, QuotaType::Requests, dec!(1)).await.unwrap(),
            QuotaDecision::Allowed(None)
        ));
    }

    #[tokio::test]
    async fn consume_invalidates_cached_usage() {
        let (service, quotas, _) = service();
        let scope = Scope::api_key(Uuid::new_v4());
        let q = quota(scope, QuotaType::Tokens, QuotaPeriod::Hour, dec!(100));
        quotas.rows.insert(q.id, q);

        // Prime the cache, consume, then verify the next check sees the
        // committed value rather than the stale zero.
        let service_cached = QuotaService::new(
            service.quotas.clone(),
            service.usage.clone(),
            CacheService::new(true),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(matches!(
            service_cached.check(&scope, QuotaType::Tokens, dec!(10)).await.unwrap(),
            QuotaDecision::Allowed(Some(_))
        ));
        service_cached.consume(&scope, QuotaType::Tokens, dec!(95)).await.unwrap();

        match service_cached.check(&scope, QuotaType::Tokens, dec!(10)).await.unwrap() {
            QuotaDecision::Denied(denial) => assert_eq!(denial.used, dec!(95)),
            QuotaDecision::Allowed(_) => panic!("stale cache admitted over limit"),
        }
    }
}
