//! # Outbox Testing
//!
//! In-memory implementations of every collaborator trait of the outbox engine.
//!
//! This crate provides:
//! - [`InMemoryStore`]: transactional `orders` + `outbox` with real skip-locked
//!   row locking, call counters and failure injection
//! - [`InMemoryIdempotencyStore`]: key/value store with tokio-time expiry, so
//!   TTLs can be exercised under `tokio::time::pause`
//! - [`InMemoryChannel`]: broadcast pub/sub without persistence, with a log of
//!   every accepted publish and injectable publish failures
//! - Deterministic clocks
//!
//! ## Example
//!
//! ```ignore
//! use outbox_testing::{InMemoryStore, InMemoryChannel, stepping_clock};
//!
//! #[tokio::test]
//! async fn relays_pending_rows() {
//!     let store = InMemoryStore::new();
//!     let channel = InMemoryChannel::new();
//!     store.seed_pending(4, &stepping_clock());
//!
//!     let worker = RelayWorker::new(store.clone(), channel.clone(), RelayConfig::default());
//!     worker.process_batch().await.unwrap();
//!
//!     assert_eq!(channel.published().len(), 4);
//! }
//! ```

pub mod channel;
pub mod idempotency;
pub mod store;

pub use channel::InMemoryChannel;
pub use idempotency::InMemoryIdempotencyStore;
pub use store::{InMemoryStore, InMemoryTransaction, StoreOp};

/// Mock implementations of environment traits
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use outbox_core::environment::Clock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::FixedClock;
    /// use outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that advances by a fixed step on every read.
    ///
    /// Records written through it get strictly increasing `created_at`
    /// values, which pins down relay order in tests.
    #[derive(Debug, Clone)]
    pub struct SteppingClock {
        start: DateTime<Utc>,
        step_millis: i64,
        ticks: Arc<AtomicI64>,
    }

    impl SteppingClock {
        /// Create a clock starting at `start`, advancing `step_millis` per read.
        #[must_use]
        pub fn new(start: DateTime<Utc>, step_millis: i64) -> Self {
            Self {
                start,
                step_millis,
                ticks: Arc::new(AtomicI64::new(0)),
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            self.start + Duration::milliseconds(tick.saturating_mul(self.step_millis))
        }
    }

    /// 2025-01-01 00:00:00 UTC, the epoch of every test clock.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// Create a stepping clock for tests: starts at the test epoch, 1ms per read.
    #[must_use]
    pub fn stepping_clock() -> SteppingClock {
        SteppingClock::new(test_epoch(), 1)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, SteppingClock, stepping_clock, test_clock};
