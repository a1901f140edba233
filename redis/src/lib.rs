//! Redis adapters for the outbox engine.
//!
//! - [`RedisIdempotencyStore`]: `SET NX PX` semantics for the idempotency guard,
//!   with the existing value returned atomically by a Lua script
//! - [`RedisNotificationChannel`]: fire-and-forget pub/sub for relayed events
//!
//! Both hold a `ConnectionManager`, which reconnects transparently; clones
//! share the connection.
//!
//! # Example
//!
//! ```no_run
//! use outbox_redis::{RedisIdempotencyStore, RedisNotificationChannel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = RedisIdempotencyStore::connect("redis://127.0.0.1:6379").await?;
//! let channel = RedisNotificationChannel::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod idempotency;

pub use channel::RedisNotificationChannel;
pub use idempotency::RedisIdempotencyStore;

use std::time::Duration;

/// Whether a Redis error means the server cannot be reached.
pub(crate) fn is_connectivity(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped()
}

/// TTL in whole milliseconds, at least one (`PX 0` is rejected by Redis).
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_rounded_to_millis_and_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
