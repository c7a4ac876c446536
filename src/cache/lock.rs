// ============================================================================
// Distributed Lock - Named Mutex with Fencing Tokens
// ============================================================================
//
// SETNX-style named mutex: acquisition returns a 128-bit random fencing
// token, and release/extend are compare-and-act against that token so a
// holder whose TTL lapsed can never clobber the next holder. The compare
// step runs under the map shard lock, the in-process equivalent of a
// server-side script.
//
// Lock TTL must exceed the longest critical section; long-running holders
// call `extend` before expiry.
//
// ============================================================================

use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// All acquisition attempts found the lock held by someone else.
    #[error("lock not obtained")]
    NotObtained,
    /// The token does not match the current holder (expired or stolen).
    #[error("lock not held")]
    NotHeld,
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            max_retries: 3,
        }
    }
}

/// Process-scoped lock table. Lock names are prefixed by subject kind; see
/// the helpers at the bottom of this module.
pub struct LockService {
    locks: Arc<DashMap<String, LockEntry>>,
}

impl LockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { locks: Arc::new(DashMap::new()) })
    }

    fn fencing_token() -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    /// Single SETNX-equivalent attempt.
    pub fn try_acquire(&self, name: &str, ttl: Duration) -> Option<String> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        let token = Self::fencing_token();
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at > now {
                    return None;
                }
                entry.token = token.clone();
                entry.expires_at = now + ttl;
                Some(token)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry { token: token.clone(), expires_at: now + ttl });
                Some(token)
            }
        }
    }

    /// Acquire with retries. Fails with `NotObtained` once the retry budget
    /// is spent.
    pub async fn acquire(&self, name: &str, options: LockOptions) -> Result<String, LockError> {
        for attempt in 0..=options.max_retries {
            if let Some(token) = self.try_acquire(name, options.ttl) {
                return Ok(token);
            }
            if attempt < options.max_retries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }
        tracing::debug!(lock = name, "lock not obtained after retries");
        Err(LockError::NotObtained)
    }

    /// Compare-and-delete. Fails with `NotHeld` if the token no longer owns
    /// the lock (TTL expiry followed by re-acquisition included).
    pub fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let now = Instant::now();
        let removed = self
            .locks
            .remove_if(name, |_, entry| entry.token == token && now < entry.expires_at);
        match removed {
            Some(_) => Ok(()),
            None => Err(LockError::NotHeld),
        }
    }

    /// Compare-and-expire. Resets the TTL from now; same token rules as
    /// `release`.
    pub fn extend(&self, name: &str, token: &str, new_ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        match self.locks.get_mut(name) {
            Some(mut entry) if entry.token == token && now < entry.expires_at => {
                entry.expires_at = now + new_ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }

    pub fn is_held(&self, name: &str, token: &str) -> bool {
        self.locks
            .get(name)
            .map(|entry| entry.token == token && Instant::now() < entry.expires_at)
            .unwrap_or(false)
    }

    /// Run `fn` under the named lock, releasing on every exit path including
    /// panics (the guard releases on drop).
    pub async fn with_lock<T, F, Fut>(
        self: &Arc<Self>,
        name: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let token = self.acquire(name, options).await?;
        let _guard = LockGuard {
            service: Arc::clone(self),
            name: name.to_string(),
            token,
        };
        Ok(f().await)
    }
}

struct LockGuard {
    service: Arc<LockService>,
    name: String,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.service.release(&self.name, &self.token) {
            // Expired under us; the next holder owns the name now.
            tracing::warn!(lock = %self.name, error = %e, "lock release after expiry");
        }
    }
}

pub fn billing_lock(user_id: Uuid) -> String {
    format!("lock:billing:{user_id}")
}

pub fn user_lock(user_id: Uuid) -> String {
    format!("lock:user:{user_id}")
}

pub fn quota_lock(scope: &crate::models::Scope, quota_type: crate::models::QuotaType) -> String {
    format!("lock:quota:{scope}:{}", quota_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(ttl_ms: u64) -> LockOptions {
        LockOptions {
            ttl: Duration::from_millis(ttl_ms),
            retry_delay: Duration::from_millis(5),
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let locks = LockService::new();
        let token = locks.acquire("lock:test:a", opts(1000)).await.unwrap();
        assert!(locks.is_held("lock:test:a", &token));
        locks.release("lock:test:a", &token).unwrap();
        assert!(!locks.is_held("lock:test:a", &token));
    }

    #[tokio::test]
    async fn contended_acquire_fails_with_not_obtained() {
        let locks = LockService::new();
        let _held = locks.acquire("lock:test:b", opts(5000)).await.unwrap();
        let err = locks.acquire("lock:test:b", opts(5000)).await.unwrap_err();
        assert_eq!(err, LockError::NotObtained);
    }

    #[tokio::test]
    async fn release_with_wrong_token_fails() {
        let locks = LockService::new();
        let _token = locks.acquire("lock:test:c", opts(1000)).await.unwrap();
        assert_eq!(
            locks.release("lock:test:c", "deadbeef"),
            Err(LockError::NotHeld)
        );
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_or_extend_after_reacquisition() {
        let locks = LockService::new();
        let stale = locks.acquire("lock:test:d", opts(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // TTL lapsed; a second party takes the lock.
        let fresh = locks.try_acquire("lock:test:d", Duration::from_secs(5)).unwrap();
        assert_ne!(stale, fresh);

        assert_eq!(locks.release("lock:test:d", &stale), Err(LockError::NotHeld));
        assert_eq!(
            locks.extend("lock:test:d", &stale, Duration::from_secs(5)),
            Err(LockError::NotHeld)
        );
        assert!(locks.is_held("lock:test:d", &fresh));
    }

    #[tokio::test]
    async fn extend_pushes_expiry() {
        let locks = LockService::new();
        let token = locks.acquire("lock:test:e", opts(50)).await.unwrap();
        locks.extend("lock:test:e", &token, Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(locks.is_held("lock:test:e", &token));
    }

    #[tokio::test]
    async fn with_lock_releases_on_exit() {
        let locks = LockService::new();
        let value = locks
            .with_lock("lock:test:f", opts(1000), || async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        // Released: immediately acquirable again.
        assert!(locks.try_acquire("lock:test:f", Duration::from_secs(1)).is_some());
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquisition() {
        let locks = LockService::new();
        let a = locks.try_acquire("lock:test:g", Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = locks.try_acquire("lock:test:g", Duration::from_millis(10)).unwrap();
        assert_ne!(a, b);
    }
}
