//! In-memory idempotency key/value store.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests can advance time
//! with `tokio::time::pause` / `advance` instead of sleeping.

use outbox_core::idempotency::{IdempotencyError, IdempotencyStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, (String, Instant)>,
    failure: Option<IdempotencyError>,
    set_if_absent_calls: usize,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&String> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|(_, expires)| *expires <= now) {
            self.entries.remove(key);
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    fn check(&self) -> Result<(), IdempotencyError> {
        self.failure.clone().map_or(Ok(()), Err)
    }
}

/// In-memory key/value store with atomic set-if-absent and expiry.
///
/// Clones share the same keyspace.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Make every command fail with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<IdempotencyError>) {
        self.with_state(|s| s.failure = err);
    }

    /// Current live value of `key`, ignoring injected failures.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.with_state(|s| s.live(key).cloned())
    }

    /// Remaining time to live of `key`.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_state(|s| {
            s.live(key)?;
            s.entries
                .get(key)
                .map(|(_, expires)| expires.saturating_duration_since(Instant::now()))
        })
    }

    /// Number of `set_if_absent` calls received.
    #[must_use]
    pub fn admit_calls(&self) -> usize {
        self.with_state(|s| s.set_if_absent_calls)
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, IdempotencyError> {
        self.with_state(|s| {
            s.set_if_absent_calls += 1;
            s.check()?;
            if let Some(existing) = s.live(key) {
                return Ok(Some(existing.clone()));
            }
            s.entries
                .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            Ok(None)
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), IdempotencyError> {
        self.with_state(|s| {
            s.check()?;
            s.entries
                .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        self.with_state(|s| {
            s.check()?;
            s.entries.remove(key);
            Ok(())
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, IdempotencyError> {
        self.with_state(|s| {
            s.check()?;
            if s.live(key).is_some_and(|current| current == expected) {
                s.entries.remove(key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        self.with_state(|s| {
            s.check()?;
            Ok(s.live(key).cloned())
        })
    }
}
