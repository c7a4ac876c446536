// ============================================================================
// Credential Validator - API Key Authentication
// ============================================================================
//
// Validates a presented key string: syntactic check (no I/O), read-through
// cached key and user lookups, status and expiry evaluation, then a
// fire-and-forget last-used update. Admin mutations of keys or users must
// invalidate the corresponding cache entries; until then a revocation can
// take up to `api_key_ttl` to bite, which is the documented trade-off.
//
// ============================================================================

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{keys, CacheService};
use crate::middleware::error_handling::{GatewayError, Result};
use crate::middleware::metrics::record_auth_failure;
use crate::models::{ApiKey, ApiKeyStatus, User};
use crate::repositories::{ApiKeyStore, StoreError, UserStore};

/// The authenticated subject attached to the request after validation.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: ApiKey,
    pub user: User,
}

pub struct AuthService {
    api_keys: Arc<dyn ApiKeyStore>,
    users: Arc<dyn UserStore>,
    cache: Arc<CacheService>,
    api_key_ttl: Duration,
    user_ttl: Duration,
}

impl AuthService {
    pub fn new(
        api_keys: Arc<dyn ApiKeyStore>,
        users: Arc<dyn UserStore>,
        cache: Arc<CacheService>,
        api_key_ttl: Duration,
        user_ttl: Duration,
    ) -> Self {
        Self { api_keys, users, cache, api_key_ttl, user_ttl }
    }

    pub async fn validate(&self, presented: &str) -> Result<AuthContext> {
        if !ApiKey::is_valid_format(presented) {
            record_auth_failure("invalid_format");
            return Err(GatewayError::InvalidApiKey);
        }

        let cache_key = keys::api_key(presented);
        let api_key = match self.cache.get_json::<ApiKey>(&cache_key) {
            Some(cached) => cached,
            None => match self.api_keys.get_by_key(presented).await {
                Ok(key) => {
                    self.cache.set_json(&cache_key, &key, self.api_key_ttl);
                    key
                }
                Err(StoreError::NotFound) => {
                    record_auth_failure("unknown_key");
                    return Err(GatewayError::InvalidApiKey);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let now = Utc::now();
        match api_key.effective_status(now) {
            ApiKeyStatus::Active => {}
            ApiKeyStatus::Expired => {
                // Stored status may still say active; drop the cached copy so
                // the next lookup re-evaluates against the row.
                self.cache.delete(&[cache_key.as_str()]);
                record_auth_failure("expired_key");
                return Err(GatewayError::ApiKeyExpired);
            }
            ApiKeyStatus::Revoked => {
                record_auth_failure("revoked_key");
                return Err(GatewayError::ApiKeyRevoked);
            }
        }

        let user = self.load_user(api_key.user_id).await?;
        if !user.is_active() {
            record_auth_failure("user_inactive");
            return Err(GatewayError::UserInactive);
        }

        // Best-effort bookkeeping, off the hot path.
        let api_keys = Arc::clone(&self.api_keys);
        let key_id = api_key.id;
        tokio::spawn(async move {
            if let Err(e) = api_keys.update_last_used(key_id, now).await {
                tracing::warn!(api_key_id = %key_id, error = %e, "last-used update failed");
            }
        });

        Ok(AuthContext { api_key, user })
    }

    async fn load_user(&self, user_id: uuid::Uuid) -> Result<User> {
        let cache_key = keys::user(user_id);
        if let Some(user) = self.cache.get_json::<User>(&cache_key) {
            return Ok(user);
        }
        match self.users.get_by_id(user_id).await {
            Ok(user) => {
                self.cache.set_json(&cache_key, &user, self.user_ttl);
                Ok(user)
            }
            Err(StoreError::NotFound) => {
                // Key row points at a deleted user; treat as an unusable key.
                record_auth_failure("user_missing");
                Err(GatewayError::InvalidApiKey)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use dashmap::DashMap;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct MemKeys {
        rows: DashMap<String, ApiKey>,
        lookups: AtomicU32,
    }

    #[async_trait]
    impl ApiKeyStore for MemKeys {
        async fn get_by_id(&self, id: Uuid) -> crate::repositories::StoreResult<ApiKey> {
            self.rows
                .iter()
                .find(|e| e.value().id == id)
                .map(|e| e.value().clone())
                .ok_or(StoreError::NotFound)
        }
        async fn get_by_key(&self, key: &str) -> crate::repositories::StoreResult<ApiKey> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            self.rows.get(key).map(|e| e.clone()).ok_or(StoreError::NotFound)
        }
        async fn list_active_by_user(
            &self,
            _user_id: Uuid,
        ) -> crate::repositories::StoreResult<Vec<ApiKey>> {
            Ok(vec![])
        }
        async fn update_last_used(
            &self,
            _id: Uuid,
            _at: DateTime<Utc>,
        ) -> crate::repositories::StoreResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemUsers {
        rows: DashMap<Uuid, User>,
    }

    #[async_trait]
    impl UserStore for MemUsers {
        async fn get_by_id(&self, id: Uuid) -> crate::repositories::StoreResult<User> {
            self.rows.get(&id).map(|e| e.clone()).ok_or(StoreError::NotFound)
        }
        async fn get_by_username(&self, _u: &str) -> crate::repositories::StoreResult<User> {
            Err(StoreError::NotFound)
        }
        async fn get_by_email(&self, _e: &str) -> crate::repositories::StoreResult<User> {
            Err(StoreError::NotFound)
        }
        async fn update_balance(
            &self,
            _id: Uuid,
            _b: rust_decimal::Decimal,
        ) -> crate::repositories::StoreResult<()> {
            Ok(())
        }
        async fn update_profile(
            &self,
            _id: Uuid,
            _u: Option<&str>,
            _e: Option<&str>,
        ) -> crate::repositories::StoreResult<()> {
            Ok(())
        }
    }

    fn user(status: UserStatus) -> User {
        User {
            id: Uuid::new_v4(),
            username: "u1".into(),
            email: "u1@example.com".into(),
            password_hash: None,
            status,
            balance: dec!(1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn api_key(user_id: Uuid, status: ApiKeyStatus, expires_at: Option<DateTime<Utc>>) -> ApiKey {
        let key = ApiKey::generate_key();
        ApiKey {
            id: Uuid::new_v4(),
            user_id,
            key_prefix: ApiKey::display_prefix(&key),
            key,
            status,
            permissions: None,
            expires_at,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        keys: Arc<MemKeys>,
        users: Arc<MemUsers>,
        service: AuthService,
    }

    fn fixture(key_ttl: Duration) -> Fixture {
        let keys = Arc::new(MemKeys::default());
        let users = Arc::new(MemUsers::default());
        let service = AuthService::new(
            keys.clone(),
            users.clone(),
            CacheService::new(true),
            key_ttl,
            key_ttl,
        );
        Fixture { keys, users, service }
    }

    #[tokio::test]
    async fn valid_key_yields_context() {
        let fixture = fixture(Duration::from_secs(60));
        let user = user(UserStatus::Active);
        let key = api_key(user.id, ApiKeyStatus::Active, None);
        fixture.keys.rows.insert(key.key.clone(), key.clone());
        fixture.users.rows.insert(user.id, user.clone());

        let ctx = fixture.service.validate(&key.key).await.unwrap();
        assert_eq!(ctx.api_key.id, key.id);
        assert_eq!(ctx.user.id, user.id);
    }

    #[tokio::test]
    async fn malformed_key_never_hits_store() {
        let fixture = fixture(Duration::from_secs(60));
        let err = fixture.service.validate("sk-not-ours").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidApiKey));
        assert_eq!(fixture.keys.lookups.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let fixture = fixture(Duration::from_secs(60));
        let err = fixture
            .service
            .validate(&ApiKey::generate_key())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidApiKey));
        assert_eq!(fixture.keys.lookups.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn revoked_and_expired_keys_are_rejected() {
        let fixture = fixture(Duration::from_secs(60));
        let user = user(UserStatus::Active);
        fixture.users.rows.insert(user.id, user.clone());

        let revoked = api_key(user.id, ApiKeyStatus::Revoked, None);
        fixture.keys.rows.insert(revoked.key.clone(), revoked.clone());
        assert!(matches!(
            fixture.service.validate(&revoked.key).await.unwrap_err(),
            GatewayError::ApiKeyRevoked
        ));

        let expired = api_key(
            user.id,
            ApiKeyStatus::Active,
            Some(Utc::now() - ChronoDuration::seconds(5)),
        );
        fixture.keys.rows.insert(expired.key.clone(), expired.clone());
        assert!(matches!(
            fixture.service.validate(&expired.key).await.unwrap_err(),
            GatewayError::ApiKeyExpired
        ));
    }

    #[tokio::test]
    async fn suspended_user_is_rejected() {
        let fixture = fixture(Duration::from_secs(60));
        let user = user(UserStatus::Suspended);
        let key = api_key(user.id, ApiKeyStatus::Active, None);
        fixture.keys.rows.insert(key.key.clone(), key.clone());
        fixture.users.rows.insert(user.id, user.clone());

        assert!(matches!(
            fixture.service.validate(&key.key).await.unwrap_err(),
            GatewayError::UserInactive
        ));
    }

    #[tokio::test]
    async fn revocation_takes_effect_within_cache_ttl() {
        let ttl = Duration::from_millis(50);
        let fixture = fixture(ttl);
        let user = user(UserStatus::Active);
        let mut key = api_key(user.id, ApiKeyStatus::Active, None);
        fixture.keys.rows.insert(key.key.clone(), key.clone());
        fixture.users.rows.insert(user.id, user.clone());

        assert!(fixture.service.validate(&key.key).await.is_ok());

        // Admin revokes the row; the cached copy masks it until the TTL
        // lapses, never longer.
        key.status = ApiKeyStatus::Revoked;
        fixture.keys.rows.insert(key.key.clone(), key.clone());
        assert!(fixture.service.validate(&key.key).await.is_ok());

        tokio::time::sleep(ttl + Duration::from_millis(20)).await;
        assert!(matches!(
            fixture.service.validate(&key.key).await.unwrap_err(),
            GatewayError::ApiKeyRevoked
        ));
    }
}
