// ============================================================================
// Billing Engine - Cost Calculation and Locked Settlement
// ============================================================================
//
// Cost comes from the current pricing rows: token-unit prices are quoted per
// 1000 tokens, request-unit prices per request, summed and rounded to the
// configured precision. A missing pricing row substitutes the configured
// default and bumps a warning counter; pricing never fails a request.
//
// Settlement serializes on `lock:billing:<user>`: re-read balance, then
// debit + ledger insert as one unit. If the lock cannot be obtained the
// charge is parked as a pending record for the reconciler. The invariant a
// reconciler checks: sum of processed amounts = credits - current balance.
//
// ============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::cache::lock::{billing_lock, LockError, LockOptions, LockService};
use crate::cache::{keys, CacheService};
use crate::config::BillingConfig;
use crate::middleware::error_handling::{GatewayError, Result};
use crate::middleware::metrics;
use crate::models::{BillingRecord, BillingStatus, PricingType, PricingUnit, UsageLog, User};
use crate::repositories::{BillingStore, PricingStore, StoreError, StoreResult, UserStore};
use uuid::Uuid;

const TOKENS_PER_PRICE_UNIT: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Processed { amount: Decimal, new_balance: Decimal },
    /// Lock unobtainable; a pending ledger row was parked for the reconciler.
    Parked,
    /// Zero-cost request: nothing to debit, nothing to record.
    Skipped,
}

pub struct BillingService {
    users: Arc<dyn UserStore>,
    pricing: Arc<dyn PricingStore>,
    billing: Arc<dyn BillingStore>,
    locks: Arc<LockService>,
    cache: Arc<CacheService>,
    config: BillingConfig,
}

impl BillingService {
    pub fn new(
        users: Arc<dyn UserStore>,
        pricing: Arc<dyn PricingStore>,
        billing: Arc<dyn BillingStore>,
        locks: Arc<LockService>,
        cache: Arc<CacheService>,
        config: BillingConfig,
    ) -> Self {
        Self { users, pricing, billing, locks, cache, config }
    }

    /// Cost of one served request from actual token counts.
    pub async fn calculate_cost(
        &self,
        model_id: Uuid,
        input_tokens: u32,
        output_tokens: u32,
        request_count: u32,
    ) -> StoreResult<Decimal> {
        let now = Utc::now();
        let mut total = Decimal::ZERO;
        total += self
            .priced_amount(model_id, PricingType::Input, input_tokens, request_count, now)
            .await?;
        total += self
            .priced_amount(model_id, PricingType::Output, output_tokens, request_count, now)
            .await?;
        // Per-request surcharge rows are optional and default to zero.
        if let Ok(row) = self.pricing.current(model_id, PricingType::Request, now).await {
            total += Decimal::from(request_count) * row.price_per_unit;
        }
        Ok(total.round_dp(self.config.precision))
    }

    async fn priced_amount(
        &self,
        model_id: Uuid,
        pricing_type: PricingType,
        tokens: u32,
        request_count: u32,
        at: chrono::DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let row = match self.pricing.current(model_id, pricing_type, at).await {
            Ok(row) => row,
            Err(StoreError::NotFound) => {
                metrics::PRICING_FALLBACKS.with_label_values(&[pricing_type.as_label()]).inc();
                tracing::warn!(
                    %model_id, ?pricing_type,
                    "no current pricing row, substituting configured default"
                );
                return Ok(
                    Decimal::from(tokens) * self.config.default_token_price
                        / TOKENS_PER_PRICE_UNIT,
                );
            }
            Err(e) => return Err(e),
        };

        Ok(match row.unit {
            PricingUnit::Token => Decimal::from(tokens) * row.price_per_unit / TOKENS_PER_PRICE_UNIT,
            PricingUnit::Request => Decimal::from(request_count) * row.price_per_unit,
            PricingUnit::Character => Decimal::from(tokens) * row.price_per_unit,
        })
    }

    /// Worst-case cost bound for the pre-flight balance gate: the whole
    /// `max_tokens` priced as output plus the estimated prompt as input.
    pub async fn estimate_cost(
        &self,
        model_id: Uuid,
        estimated_prompt_tokens: u32,
        max_tokens: u32,
    ) -> StoreResult<Decimal> {
        self.calculate_cost(model_id, estimated_prompt_tokens, max_tokens, 1)
            .await
    }

    /// Cheap admission gate before any upstream dispatch.
    pub fn check_balance(&self, user: &User, estimated_cost: Decimal) -> Result<()> {
        if user.balance < estimated_cost {
            metrics::BILLING_SETTLEMENTS.with_label_values(&["preflight_denied"]).inc();
            return Err(GatewayError::InsufficientBalance {
                balance: user.balance,
                required: estimated_cost,
            });
        }
        Ok(())
    }

    /// Post-flight settlement for a usage-log row whose upstream call
    /// succeeded. Serialized per user by the billing lock.
    pub async fn settle(&self, usage: &UsageLog) -> Result<SettlementOutcome> {
        if usage.cost <= Decimal::ZERO {
            return Ok(SettlementOutcome::Skipped);
        }

        let lock_name = billing_lock(usage.user_id);
        let lock_options = LockOptions {
            ttl: self.config.settle_lock_ttl,
            retry_delay: std::time::Duration::from_millis(50),
            max_retries: self.config.settle_lock_retries,
        };

        let token = match self.locks.acquire(&lock_name, lock_options).await {
            Ok(token) => token,
            Err(LockError::NotObtained) | Err(LockError::NotHeld) => {
                // Park the charge rather than stall the response path.
                let record =
                    BillingRecord::usage(usage.user_id, usage.id, usage.cost, &self.config.currency, BillingStatus::Pending)
                        .with_description("settlement deferred: billing lock unobtainable");
                self.billing.insert(&record).await.map_err(GatewayError::Store)?;
                metrics::BILLING_SETTLEMENTS.with_label_values(&["parked"]).inc();
                tracing::warn!(user_id = %usage.user_id, usage_log_id = %usage.id, "billing settlement parked");
                return Ok(SettlementOutcome::Parked);
            }
        };

        let outcome = self.settle_locked(usage).await;
        if let Err(e) = self.locks.release(&lock_name, &token) {
            tracing::warn!(lock = %lock_name, error = %e, "billing lock release failed");
        }
        outcome
    }

    async fn settle_locked(&self, usage: &UsageLog) -> Result<SettlementOutcome> {
        // Authoritative balance, not the cached copy the request was
        // admitted with.
        let user = self.users.get_by_id(usage.user_id).await.map_err(GatewayError::Store)?;

        if user.balance < usage.cost {
            let record = BillingRecord::usage(
                usage.user_id,
                usage.id,
                usage.cost,
                &self.config.currency,
                BillingStatus::Failed,
            )
            .with_description("insufficient balance at settlement");
            self.billing.insert(&record).await.map_err(GatewayError::Store)?;
            metrics::BILLING_SETTLEMENTS.with_label_values(&["insufficient"]).inc();
            return Err(GatewayError::InsufficientBalance {
                balance: user.balance,
                required: usage.cost,
            });
        }

        let new_balance = user.balance - usage.cost;
        let record = BillingRecord::usage(
            usage.user_id,
            usage.id,
            usage.cost,
            &self.config.currency,
            BillingStatus::Processed,
        );

        match self.billing.debit_and_record(usage.user_id, new_balance, &record).await {
            Ok(()) => {}
            Err(debit_err) => {
                self.compensate(usage, user.balance, new_balance, &debit_err).await;
                metrics::BILLING_SETTLEMENTS.with_label_values(&["failed"]).inc();
                return Err(GatewayError::Store(debit_err));
            }
        }

        self.cache.delete(&[keys::user(usage.user_id).as_str()]);
        metrics::BILLING_SETTLEMENTS.with_label_values(&["processed"]).inc();
        tracing::info!(
            user_id = %usage.user_id,
            usage_log_id = %usage.id,
            amount = %usage.cost,
            balance = %new_balance,
            "billing settled"
        );

        Ok(SettlementOutcome::Processed { amount: usage.cost, new_balance })
    }

    /// If the combined debit+insert failed partway (a store without
    /// transactional semantics), credit the exact amount back. Both the
    /// original and any rollback error are logged; still under the lock, so
    /// the re-read is authoritative.
    async fn compensate(
        &self,
        usage: &UsageLog,
        old_balance: Decimal,
        attempted_balance: Decimal,
        original: &StoreError,
    ) {
        match self.users.get_by_id(usage.user_id).await {
            Ok(current) if current.balance == attempted_balance => {
                if let Err(rollback) = self.users.update_balance(usage.user_id, old_balance).await {
                    tracing::error!(
                        user_id = %usage.user_id,
                        original_error = %original,
                        rollback_error = %rollback,
                        "billing compensation failed, balance debit without ledger row"
                    );
                } else {
                    tracing::error!(
                        user_id = %usage.user_id,
                        original_error = %original,
                        amount = %usage.cost,
                        "billing settlement failed after debit, amount credited back"
                    );
                }
            }
            Ok(_) => {
                tracing::error!(
                    user_id = %usage.user_id,
                    original_error = %original,
                    "billing settlement failed before debit, nothing to compensate"
                );
            }
            Err(read_err) => {
                tracing::error!(
                    user_id = %usage.user_id,
                    original_error = %original,
                    read_error = %read_err,
                    "billing compensation could not verify balance"
                );
            }
        }
    }
}

impl PricingType {
    fn as_label(&self) -> &'static str {
        match self {
            PricingType::Input => "input",
            PricingType::Output => "output",
            PricingType::Request => "request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelPricing, UserStatus};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemUsers {
        rows: DashMap<Uuid, User>,
    }

    #[async_trait]
    impl UserStore for MemUsers {
        async fn get_by_id(&self, id: Uuid) -> StoreResult<User> {
            self.rows.get(&id).map(|e| e.clone()).ok_or(StoreError::NotFound)
        }
        async fn get_by_username(&self, _u: &str) -> StoreResult<User> {
            Err(StoreError::NotFound)
        }
        async fn get_by_email(&self, _e: &str) -> StoreResult<User> {
            Err(StoreError::NotFound)
        }
        async fn update_balance(&self, id: Uuid, new_balance: Decimal) -> StoreResult<()> {
            self.rows
                .get_mut(&id)
                .map(|mut e| e.balance = new_balance)
                .ok_or(StoreError::NotFound)
        }
        async fn update_profile(
            &self,
            _id: Uuid,
            _u: Option<&str>,
            _e: Option<&str>,
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    struct MemPricing {
        rows: Vec<ModelPricing>,
    }

    #[async_trait]
    impl PricingStore for MemPricing {
        async fn current(
            &self,
            model_id: Uuid,
            pricing_type: PricingType,
            at: chrono::DateTime<Utc>,
        ) -> StoreResult<ModelPricing> {
            self.rows
                .iter()
                .find(|r| r.model_id == model_id && r.pricing_type == pricing_type && r.is_current_at(at))
                .cloned()
                .ok_or(StoreError::NotFound)
        }
    }

    #[derive(Default)]
    struct MemBilling {
        users: Arc<MemUsers>,
        records: Mutex<Vec<BillingRecord>>,
    }

    #[async_trait]
    impl BillingStore for MemBilling {
        async fn insert(&self, record: &BillingRecord) -> StoreResult<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
        async fn debit_and_record(
            &self,
            user_id: Uuid,
            new_balance: Decimal,
            record: &BillingRecord,
        ) -> StoreResult<()> {
            self.users.update_balance(user_id, new_balance).await?;
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn pricing_row(model_id: Uuid, pricing_type: PricingType, price: Decimal) -> ModelPricing {
        ModelPricing {
            id: Uuid::new_v4(),
            model_id,
            pricing_type,
            price_per_unit: price,
            unit: PricingUnit::Token,
            currency: "USD".into(),
            effective_from: Utc::now() - chrono::Duration::days(1),
            effective_until: None,
        }
    }

    fn service(
        users: Arc<MemUsers>,
        pricing: Vec<ModelPricing>,
    ) -> (BillingService, Arc<MemBilling>) {
        let billing = Arc::new(MemBilling { users: users.clone(), records: Mutex::default() });
        let config = BillingConfig {
            currency: "USD".into(),
            precision: 6,
            default_token_price: Decimal::ZERO,
            settle_lock_ttl: std::time::Duration::from_secs(5),
            settle_lock_retries: 3,
        };
        (
            BillingService::new(
                users,
                Arc::new(MemPricing { rows: pricing }),
                billing.clone(),
                LockService::new(),
                CacheService::new(false),
                config,
            ),
            billing,
        )
    }

    fn user_with_balance(balance: Decimal) -> User {
        User {
            id: Uuid::new_v4(),
            username: "u1".into(),
            email: "u1@example.com".into(),
            password_hash: None,
            status: UserStatus::Active,
            balance,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn usage_log(user_id: Uuid, cost: Decimal) -> UsageLog {
        UsageLog {
            id: Uuid::new_v4(),
            user_id,
            api_key_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            model_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            method: "POST".into(),
            endpoint: "/v1/chat/completions".into(),
            input_tokens: 10,
            output_tokens: 20,
            request_bytes: 100,
            response_bytes: 200,
            duration_ms: 50,
            status_code: 200,
            cost,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn token_prices_scale_per_thousand() {
        let users = Arc::new(MemUsers::default());
        let model_id = Uuid::new_v4();
        let (service, _) = service(
            users,
            vec![
                pricing_row(model_id, PricingType::Input, dec!(0.001)),
                pricing_row(model_id, PricingType::Output, dec!(0.002)),
            ],
        );

        // input=1500 @ $0.001/1K => $0.0015
        let cost = service.calculate_cost(model_id, 1500, 0, 1).await.unwrap();
        assert_eq!(cost, dec!(0.0015));

        // 10 in + 20 out at S1 pricing => 0.00005
        let cost = service.calculate_cost(model_id, 10, 20, 1).await.unwrap();
        assert_eq!(cost, dec!(0.00005));
    }

    #[tokio::test]
    async fn cost_rounds_to_configured_precision() {
        let users = Arc::new(MemUsers::default());
        let model_id = Uuid::new_v4();
        let (service, _) = service(
            users,
            vec![pricing_row(model_id, PricingType::Input, dec!(0.0033))],
        );

        // 507 * 0.0033 / 1000 = 0.0016731 -> six decimal places
        let cost = service.calculate_cost(model_id, 507, 0, 1).await.unwrap();
        assert_eq!(cost, dec!(0.001673));
        assert!(cost.scale() <= 6);

        // Sub-precision amounts collapse to zero rather than failing.
        let cost = service.calculate_cost(model_id, 0, 0, 1).await.unwrap();
        assert_eq!(cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn missing_pricing_substitutes_default() {
        let users = Arc::new(MemUsers::default());
        let model_id = Uuid::new_v4();
        let (service, _) = service(users, vec![]);

        let cost = service.calculate_cost(model_id, 1000, 1000, 1).await.unwrap();
        assert_eq!(cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn settlement_debits_and_records() {
        let users = Arc::new(MemUsers::default());
        let user = user_with_balance(dec!(1.0));
        users.rows.insert(user.id, user.clone());
        let (service, billing) = service(users.clone(), vec![]);

        let usage = usage_log(user.id, dec!(0.00005));
        let outcome = service.settle(&usage).await.unwrap();
        assert_eq!(
            outcome,
            SettlementOutcome::Processed { amount: dec!(0.00005), new_balance: dec!(0.99995) }
        );
        assert_eq!(users.rows.get(&user.id).unwrap().balance, dec!(0.99995));

        let records = billing.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BillingStatus::Processed);
        assert_eq!(records[0].usage_log_id, Some(usage.id));
    }

    #[tokio::test]
    async fn settlement_rejects_insufficient_balance_with_failed_record() {
        let users = Arc::new(MemUsers::default());
        let user = user_with_balance(dec!(0.00001));
        users.rows.insert(user.id, user.clone());
        let (service, billing) = service(users.clone(), vec![]);

        let usage = usage_log(user.id, dec!(0.6));
        let err = service.settle(&usage).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance { .. }));

        // Balance untouched, one failed ledger row.
        assert_eq!(users.rows.get(&user.id).unwrap().balance, dec!(0.00001));
        let records = billing.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BillingStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_settlements_never_overdraw() {
        let users = Arc::new(MemUsers::default());
        let user = user_with_balance(dec!(1.0));
        users.rows.insert(user.id, user.clone());
        let (service, billing) = service(users.clone(), vec![]);
        let service = Arc::new(service);

        // Two concurrent 0.6 settlements against balance 1.0: exactly one
        // processes, the other fails insufficient.
        let a = tokio::spawn({
            let service = service.clone();
            let usage = usage_log(user.id, dec!(0.6));
            async move { service.settle(&usage).await }
        });
        let b = tokio::spawn({
            let service = service.clone();
            let usage = usage_log(user.id, dec!(0.6));
            async move { service.settle(&usage).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let processed = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(GatewayError::InsufficientBalance { .. })))
            .count();
        assert_eq!(processed, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(users.rows.get(&user.id).unwrap().balance, dec!(0.4));

        let records = billing.records.lock().unwrap();
        assert_eq!(records.iter().filter(|r| r.status == BillingStatus::Processed).count(), 1);
        assert_eq!(records.iter().filter(|r| r.status == BillingStatus::Failed).count(), 1);
    }

    #[tokio::test]
    async fn zero_cost_settlement_is_a_noop() {
        let users = Arc::new(MemUsers::default());
        let user = user_with_balance(dec!(1.0));
        users.rows.insert(user.id, user.clone());
        let (service, billing) = service(users.clone(), vec![]);

        let usage = usage_log(user.id, Decimal::ZERO);
        assert_eq!(service.settle(&usage).await.unwrap(), SettlementOutcome::Skipped);
        assert!(billing.records.lock().unwrap().is_empty());
        assert_eq!(users.rows.get(&user.id).unwrap().balance, dec!(1.0));
    }
}
