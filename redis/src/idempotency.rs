//! Redis-backed idempotency store.

use crate::{is_connectivity, ttl_millis};
use outbox_core::idempotency::{IdempotencyError, IdempotencyStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::Duration;

/// Set the key unless present; return the existing value, or nil if it was set.
///
/// `SET NX` alone cannot return the existing value, and a separate `GET`
/// after a failed `SET NX` races with expiry and deletion.
const SET_IF_ABSENT: &str = r"
    local existing = redis.call('GET', KEYS[1])
    if existing then
        return existing
    end
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return false
";

/// Delete the key only if it holds ARGV[1]; return the number of keys removed.
const DELETE_IF_EQUALS: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

fn map_redis(e: &RedisError) -> IdempotencyError {
    if e.is_timeout() {
        IdempotencyError::Timeout
    } else if is_connectivity(e) {
        IdempotencyError::Unavailable(e.to_string())
    } else {
        IdempotencyError::Command(e.to_string())
    }
}

/// Idempotency keys in Redis with server-side expiry.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn_manager: ConnectionManager,
    set_if_absent: Script,
    delete_if_equals: Script,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore").finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Unavailable`] if the client cannot be
    /// created or the first connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        let client = Client::open(redis_url).map_err(|e| {
            IdempotencyError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            IdempotencyError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })?;

        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            set_if_absent: Script::new(SET_IF_ABSENT),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        }
    }

    /// Round-trip `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the server does not answer.
    pub async fn ping(&self) -> Result<(), IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis(&e))?;
        Ok(())
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        let existing: Option<String> = self
            .set_if_absent
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis(&e))?;

        if existing.is_none() {
            tracing::trace!(key, ttl_ms = ttl_millis(ttl), "SET NX PX");
        }
        Ok(existing)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        let () = conn
            .pset_ex(key, value, ttl_millis(ttl))
            .await
            .map_err(|e| map_redis(&e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        let _: usize = conn.del(key).await.map_err(|e| map_redis(&e))?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis(&e))?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        let mut conn = self.conn_manager.clone();
        conn.get(key).await.map_err(|e| map_redis(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn io_errors_are_unavailable() {
        let err = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_redis(&err), IdempotencyError::Unavailable(_)));
        assert!(map_redis(&err).is_transient());
    }

    #[test]
    fn server_errors_are_command_errors() {
        let err = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(map_redis(&err), IdempotencyError::Command(_)));
    }

    #[test]
    fn script_returns_existing_value_before_setting() {
        let get = SET_IF_ABSENT.find("'GET'").unwrap_or(usize::MAX);
        let set = SET_IF_ABSENT.find("'SET'").unwrap_or(0);
        assert!(get < set);
        assert!(SET_IF_ABSENT.contains("'PX'"));
    }

    #[test]
    fn delete_script_compares_before_deleting() {
        let get = DELETE_IF_EQUALS.find("'GET'").unwrap_or(usize::MAX);
        let del = DELETE_IF_EQUALS.find("'DEL'").unwrap_or(0);
        assert!(get < del);
    }
}
