//! Cache-key schema. The prefixes are stable: invalidation paths depend on
//! them, so new call sites must reuse these helpers instead of formatting
//! keys inline.

use crate::models::{Scope, Window};
use uuid::Uuid;

pub fn user(id: Uuid) -> String {
    format!("user:{id}")
}

pub fn user_by_username(username: &str) -> String {
    format!("user:username:{username}")
}

pub fn user_by_email(email: &str) -> String {
    format!("user:email:{email}")
}

pub fn api_key(key: &str) -> String {
    format!("apikey:{key}")
}

pub fn model(id: Uuid) -> String {
    format!("model:{id}")
}

pub fn model_by_slug(slug: &str) -> String {
    format!("model:slug:{slug}")
}

pub fn provider(id: Uuid) -> String {
    format!("provider:{id}")
}

pub fn quota(id: Uuid) -> String {
    format!("quota:{id}")
}

pub fn scope_quotas(scope: &Scope) -> String {
    format!("user_quotas:{scope}")
}

pub fn quota_usage(scope: &Scope, quota_id: Uuid, window: &Window) -> String {
    format!(
        "quota_usage:scope:{scope}:quota:{quota_id}:period:{}",
        window.period_key()
    )
}

/// Prefix covering every window of every quota for a scope.
pub fn quota_usage_scope_prefix(scope: &Scope) -> String {
    format!("quota_usage:scope:{scope}:")
}

pub fn models_active() -> String {
    "models:active".to_string()
}

pub fn providers_available() -> String {
    "providers:available".to_string()
}

pub fn model_support(model_slug: &str) -> String {
    format!("model_support:{model_slug}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaPeriod;
    use chrono::Utc;

    #[test]
    fn quota_usage_key_is_prefix_invalidatable() {
        let scope = Scope::api_key(Uuid::nil());
        let quota_id = Uuid::nil();
        let window = QuotaPeriod::Minute.window_at(Utc::now());
        let key = quota_usage(&scope, quota_id, &window);
        assert!(key.starts_with(&quota_usage_scope_prefix(&scope)));
    }
}
