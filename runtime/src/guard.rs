//! Idempotency guard.
//!
//! Protects the write path from duplicate submissions of the same client
//! token. Per token the guard moves a key through three states:
//!
//! ```text
//!            admit (SET NX PX T_lock)
//!   absent ───────────────────────────► in flight
//!     ▲                                   │   │
//!     │ release (CAS DEL), or T_lock expiry│   │ complete (SET PX T_cache)
//!     └───────────────────────────────────┘   ▼
//!                                           cached ──(T_cache expiry)──► absent
//! ```
//!
//! # Lock expiry race
//!
//! `lock_ttl` must exceed the worst-case latency of the write path. If a write
//! outlives it, the key silently reverts to absent while the write is still
//! running, and a retry with the same token is admitted and writes a second
//! order. The guard does not paper over this with a larger default; pick a
//! `lock_ttl` above the write path's tail latency, and keep the writer's
//! overall write timeout below it.
//!
//! Every admitted request stores its own [`LockHolder`] marker and releases
//! with a compare-and-delete, so the first request failing late removes only
//! its own marker, never the one written by the request admitted after expiry.

use crate::bounded;
use outbox_core::idempotency::{
    Admission, IdempotencyError, IdempotencyStore, IdempotencyToken, LockHolder, is_in_flight,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Configuration of an [`IdempotencyGuard`].
///
/// # Default Values
///
/// - `lock_ttl`: 30 seconds (`T_lock`)
/// - `cache_ttl`: 24 hours (`T_cache`)
/// - `key_prefix`: `"idempotency:"`
/// - `operation_timeout`: 2 seconds per key/value command
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Lifetime of the in-flight marker
    pub lock_ttl: Duration,
    /// Lifetime of a cached final response
    pub cache_ttl: Duration,
    /// Namespace prepended to every token
    pub key_prefix: String,
    /// Deadline for each key/value command
    pub operation_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            key_prefix: "idempotency:".to_string(),
            operation_timeout: Duration::from_secs(2),
        }
    }
}

impl GuardConfig {
    /// Set the in-flight lock TTL.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the cached response TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the per-command deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Distributed idempotency lock over a key/value store.
///
/// Stateless: clones of the same store see the same locks, so any number of
/// guards (in any number of processes) can share one keyspace.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<K> {
    store: K,
    config: GuardConfig,
}

impl<K: IdempotencyStore> IdempotencyGuard<K> {
    /// Create a guard over `store`.
    #[must_use]
    pub const fn new(store: K, config: GuardConfig) -> Self {
        Self { store, config }
    }

    /// The guard's configuration.
    #[must_use]
    pub const fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Key under which `token` is stored.
    #[must_use]
    pub fn key(&self, token: &IdempotencyToken) -> String {
        format!("{}{}", self.config.key_prefix, token)
    }

    /// Try to admit a request bearing `token`.
    ///
    /// One atomic set-if-absent decides the outcome:
    /// - key absent: it now holds a fresh holder's marker, [`Admission::Proceed`]
    /// - key holds any in-flight marker: [`Admission::InFlight`]
    /// - key holds a response: [`Admission::CachedResult`] with it decoded
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store fails or times out, or
    /// [`IdempotencyError::Serialization`] if a cached response cannot be
    /// decoded as `R`.
    pub async fn admit<R: DeserializeOwned>(
        &self,
        token: &IdempotencyToken,
    ) -> Result<Admission<R>, IdempotencyError> {
        let key = self.key(token);
        let holder = LockHolder::new();
        let existing = bounded(
            self.config.operation_timeout,
            self.store
                .set_if_absent(&key, holder.marker(), self.config.lock_ttl),
            || IdempotencyError::Timeout,
        )
        .await?;

        match existing {
            None => {
                tracing::debug!(token = %token, "Idempotency lock acquired");
                Ok(Admission::Proceed(holder))
            }
            Some(value) if is_in_flight(&value) => {
                tracing::debug!(token = %token, "Request already in flight");
                Ok(Admission::InFlight)
            }
            Some(value) => {
                let response = serde_json::from_str(&value)
                    .map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
                tracing::debug!(token = %token, "Returning cached response");
                Ok(Admission::CachedResult(response))
            }
        }
    }

    /// Replace the in-flight marker with the final response, kept for `cache_ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if encoding or the store command fails.
    pub async fn complete<R: Serialize + Sync>(
        &self,
        token: &IdempotencyToken,
        response: &R,
    ) -> Result<(), IdempotencyError> {
        let key = self.key(token);
        let value = serde_json::to_string(response)
            .map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
        bounded(
            self.config.operation_timeout,
            self.store.set(&key, &value, self.config.cache_ttl),
            || IdempotencyError::Timeout,
        )
        .await?;

        tracing::debug!(
            token = %token,
            cache_ttl_secs = self.config.cache_ttl.as_secs(),
            "Cached final response"
        );
        Ok(())
    }

    /// Delete the key so the client can retry immediately, provided it still
    /// holds `holder`'s marker.
    ///
    /// Returns `false` when the key holds something else: the lock expired
    /// and another request now owns the token, or it already completed.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store command fails. The marker
    /// then lingers until `lock_ttl` expires.
    pub async fn release(
        &self,
        token: &IdempotencyToken,
        holder: &LockHolder,
    ) -> Result<bool, IdempotencyError> {
        let key = self.key(token);
        let released = bounded(
            self.config.operation_timeout,
            self.store.delete_if_equals(&key, holder.marker()),
            || IdempotencyError::Timeout,
        )
        .await?;

        if released {
            tracing::debug!(token = %token, "Idempotency lock released");
        } else {
            tracing::warn!(token = %token, "Idempotency lock no longer held; left in place");
        }
        Ok(released)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use outbox_testing::InMemoryIdempotencyStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Body {
        id: u32,
    }

    fn token(s: &str) -> IdempotencyToken {
        s.parse().unwrap()
    }

    fn guard(store: &InMemoryIdempotencyStore) -> IdempotencyGuard<InMemoryIdempotencyStore> {
        IdempotencyGuard::new(store.clone(), GuardConfig::default())
    }

    async fn admitted(
        guard: &IdempotencyGuard<InMemoryIdempotencyStore>,
        t: &IdempotencyToken,
    ) -> LockHolder {
        match guard.admit::<Body>(t).await.unwrap() {
            Admission::Proceed(holder) => holder,
            other => panic!("expected to proceed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_admit_proceeds_second_sees_in_flight() {
        let store = InMemoryIdempotencyStore::new();
        let guard = guard(&store);
        let t = token("t1");

        let Admission::Proceed(holder) = guard.admit::<Body>(&t).await.unwrap() else {
            panic!("first admit must proceed");
        };
        assert_eq!(guard.admit::<Body>(&t).await.unwrap(), Admission::InFlight);
        assert_eq!(store.value("idempotency:t1").as_deref(), Some(holder.marker()));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_token_replays_cached_response() {
        let store = InMemoryIdempotencyStore::new();
        let guard = guard(&store);
        let t = token("t1");

        guard.admit::<Body>(&t).await.unwrap();
        guard.complete(&t, &Body { id: 7 }).await.unwrap();

        assert_eq!(
            guard.admit::<Body>(&t).await.unwrap(),
            Admission::CachedResult(Body { id: 7 })
        );
        let ttl = store.ttl("idempotency:t1").unwrap();
        assert!(ttl > Duration::from_secs(23 * 60 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn release_reverts_to_absent() {
        let store = InMemoryIdempotencyStore::new();
        let guard = guard(&store);
        let t = token("t1");

        let holder = admitted(&guard, &t).await;
        assert!(guard.release(&t, &holder).await.unwrap());

        assert!(matches!(guard.admit::<Body>(&t).await.unwrap(), Admission::Proceed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_release_a_newer_lock() {
        let store = InMemoryIdempotencyStore::new();
        let guard = IdempotencyGuard::new(
            store.clone(),
            GuardConfig::default().with_lock_ttl(Duration::from_millis(100)),
        );
        let t = token("t1");

        let stale = admitted(&guard, &t).await;
        tokio::time::advance(Duration::from_millis(101)).await;
        let current = admitted(&guard, &t).await;

        assert!(!guard.release(&t, &stale).await.unwrap());
        assert_eq!(store.value("idempotency:t1").as_deref(), Some(current.marker()));
        assert_eq!(guard.admit::<Body>(&t).await.unwrap(), Admission::InFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn release_leaves_a_cached_response() {
        let store = InMemoryIdempotencyStore::new();
        let guard = guard(&store);
        let t = token("t1");

        let holder = admitted(&guard, &t).await;
        guard.complete(&t, &Body { id: 3 }).await.unwrap();

        assert!(!guard.release(&t, &holder).await.unwrap());
        assert_eq!(
            guard.admit::<Body>(&t).await.unwrap(),
            Admission::CachedResult(Body { id: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_marker_expires_after_lock_ttl() {
        let store = InMemoryIdempotencyStore::new();
        let guard = IdempotencyGuard::new(
            store.clone(),
            GuardConfig::default().with_lock_ttl(Duration::from_millis(100)),
        );
        let t = token("t1");

        guard.admit::<Body>(&t).await.unwrap();
        tokio::time::advance(Duration::from_millis(101)).await;

        assert!(matches!(guard.admit::<Body>(&t).await.unwrap(), Admission::Proceed(_)));
    }

    #[tokio::test]
    async fn undecodable_cached_value_is_a_serialization_error() {
        let store = InMemoryIdempotencyStore::new();
        store
            .set("idempotency:t1", "{\"unexpected\":true}", Duration::from_secs(60))
            .await
            .unwrap();

        let err = guard(&store).admit::<Body>(&token("t1")).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::Serialization(_)));
    }

    #[tokio::test]
    async fn key_prefix_is_configurable() {
        let store = InMemoryIdempotencyStore::new();
        let guard = IdempotencyGuard::new(
            store.clone(),
            GuardConfig::default().with_key_prefix("orders:idem:"),
        );

        assert_eq!(guard.key(&token("abc")), "orders:idem:abc");
    }

    #[tokio::test]
    async fn store_failure_surfaces() {
        let store = InMemoryIdempotencyStore::new();
        store.set_failure(Some(IdempotencyError::Unavailable("down".into())));

        let err = guard(&store).admit::<Body>(&token("t1")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
