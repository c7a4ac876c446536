use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Namespace prefix for every gateway-issued key.
pub const KEY_NAMESPACE: &str = "pgk_";

/// Hex characters of random material after the namespace (192 bits).
const KEY_RANDOM_LEN: usize = 48;

static KEY_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pgk_[0-9a-f]{48}$").expect("key format regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key: String,
    /// First characters of the key, safe to show in listings and logs.
    pub key_prefix: String,
    pub status: ApiKeyStatus,
    pub permissions: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Syntactic key check. Deterministic, no I/O: a string that fails this
    /// never reaches the store.
    pub fn is_valid_format(presented: &str) -> bool {
        KEY_FORMAT.is_match(presented)
    }

    /// Generate a fresh key string in the gateway's namespaced format.
    pub fn generate_key() -> String {
        let mut raw = [0u8; KEY_RANDOM_LEN / 2];
        rand::thread_rng().fill_bytes(&mut raw);
        format!("{}{}", KEY_NAMESPACE, hex::encode(raw))
    }

    /// The loggable prefix of a key string (namespace + first 8 hex chars).
    pub fn display_prefix(key: &str) -> String {
        key.chars().take(KEY_NAMESPACE.len() + 8).collect()
    }

    /// Status with expiry applied: a stored-active key past `expires_at` is
    /// expired regardless of what the row says.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApiKeyStatus {
        match self.expires_at {
            Some(at) if at <= now => ApiKeyStatus::Expired,
            _ => self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn generated_keys_match_format() {
        for _ in 0..10 {
            let key = ApiKey::generate_key();
            assert!(ApiKey::is_valid_format(&key), "bad key: {key}");
        }
    }

    #[test]
    fn format_rejects_foreign_shapes() {
        assert!(!ApiKey::is_valid_format(""));
        assert!(!ApiKey::is_valid_format("sk-abcdef"));
        assert!(!ApiKey::is_valid_format("pgk_short"));
        assert!(!ApiKey::is_valid_format(&format!("pgk_{}", "Z".repeat(48))));
        assert!(!ApiKey::is_valid_format(&format!("PGK_{}", "a".repeat(48))));
    }

    #[test]
    fn display_prefix_truncates() {
        let key = format!("pgk_{}", "a".repeat(48));
        assert_eq!(ApiKey::display_prefix(&key), "pgk_aaaaaaaa");
    }

    #[test]
    fn effective_status_applies_expiry() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            key: ApiKey::generate_key(),
            key_prefix: "pgk_test".into(),
            status: ApiKeyStatus::Active,
            permissions: None,
            expires_at: Some(now - Duration::seconds(1)),
            last_used_at: None,
            created_at: now,
        };
        assert_eq!(key.effective_status(now), ApiKeyStatus::Expired);

        key.expires_at = Some(now + Duration::hours(1));
        assert_eq!(key.effective_status(now), ApiKeyStatus::Active);

        key.status = ApiKeyStatus::Revoked;
        assert_eq!(key.effective_status(now), ApiKeyStatus::Revoked);
    }
}
