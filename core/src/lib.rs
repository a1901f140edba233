//! # Outbox Core
//!
//! Domain types, error taxonomy and collaborator traits for the transactional
//! outbox engine.
//!
//! The engine solves the dual-write problem: an order must be durably recorded
//! *and* other services must be told about it, without ever losing one half or
//! exposing one half without the other. Three pieces do the work:
//!
//! - **Idempotency guard**: turns a retried client request into a safe no-op
//! - **Transactional writer**: commits the order and its outbox event atomically
//! - **Relay worker**: drains pending outbox rows into the notification channel
//!
//! This crate holds only the vocabulary those pieces share. It performs no I/O;
//! every external system sits behind a trait:
//!
//! | Trait | Production | Testing |
//! |-------|------------|---------|
//! | [`store::DurableStore`] | `PostgresStore` | `InMemoryStore` |
//! | [`idempotency::IdempotencyStore`] | `RedisIdempotencyStore` | `InMemoryIdempotencyStore` |
//! | [`channel::NotificationChannel`] | `RedisNotificationChannel` | `InMemoryChannel` |
//!
//! ## Data Flow
//!
//! ```text
//! request ─► IdempotencyGuard ─► TransactionalWriter ─► (orders + outbox, one tx)
//!                                                              │
//!                                    RelayWorker (timer) ◄─────┘
//!                                          │
//!                                          ▼
//!                               NotificationChannel ─► subscribers
//! ```

pub mod channel;
pub mod error;
pub mod idempotency;
pub mod order;
pub mod outbox;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Environment module - injected dependencies that are not stores.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Outbox records take their `created_at` from the clock, which fixes the
    /// relay order of rows written in the same process.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
