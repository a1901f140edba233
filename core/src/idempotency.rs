//! Idempotency lock vocabulary.
//!
//! An idempotency lock lives in a fast key/value store with native expiry, not
//! in the durable store. Per token it is in one of three states:
//!
//! | State | Stored value | TTL |
//! |-------|--------------|-----|
//! | absent | no key | - |
//! | in flight | [`IN_FLIGHT_MARKER`]`:<holder>` | short (`T_lock`) |
//! | cached | serialized final response | long (`T_cache`) |
//!
//! Only the idempotency guard mutates these keys. Each admitted request writes
//! its own [`LockHolder`] marker, so releasing a lock never removes a marker
//! written by a later request after the first one's lock expired.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix of the value stored under a token while its request is being
/// processed.
///
/// Cached responses are JSON documents, so they can never start with it.
pub const IN_FLIGHT_MARKER: &str = "__in_flight__";

/// Whether a stored value is an in-flight marker rather than a response.
#[must_use]
pub fn is_in_flight(value: &str) -> bool {
    value.starts_with(IN_FLIGHT_MARKER)
}

/// In-flight marker owned by one admitted request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHolder(String);

impl LockHolder {
    /// A fresh, unique marker.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{IN_FLIGHT_MARKER}:{}", uuid::Uuid::new_v4()))
    }

    /// The value stored under the token.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.0
    }
}

impl Default for LockHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum accepted token length in bytes.
pub const MAX_TOKEN_LEN: usize = 255;

/// Error type for idempotency token parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseTokenError {
    /// The token is empty
    #[error("Idempotency token cannot be empty")]
    Empty,
    /// The token exceeds [`MAX_TOKEN_LEN`]
    #[error("Idempotency token exceeds {MAX_TOKEN_LEN} bytes")]
    TooLong,
    /// The token contains whitespace or non-printable characters
    #[error("Idempotency token must be printable ASCII without whitespace")]
    InvalidCharacters,
}

/// Client-supplied idempotency token.
///
/// # Validation
///
/// `FromStr` accepts 1..=255 bytes of printable, non-whitespace ASCII, which is
/// what an HTTP header value can safely carry.
///
/// # Examples
///
/// ```
/// use outbox_core::idempotency::IdempotencyToken;
///
/// let token: IdempotencyToken = "t1".parse().unwrap();
/// assert_eq!(token.as_str(), "t1");
/// assert!("has space".parse::<IdempotencyToken>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Get the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyToken {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseTokenError::Empty);
        }
        if s.len() > MAX_TOKEN_LEN {
            return Err(ParseTokenError::TooLong);
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ParseTokenError::InvalidCharacters);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for IdempotencyToken {
    type Error = ParseTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IdempotencyToken> for String {
    fn from(token: IdempotencyToken) -> Self {
        token.0
    }
}

/// Outcome of admitting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<R> {
    /// The token was absent and is now locked by this holder; the caller must
    /// run the write.
    Proceed(LockHolder),
    /// Another request with this token is in flight; reject with "retry later".
    InFlight,
    /// The token already completed; return this response verbatim.
    CachedResult(R),
}

/// Errors that can occur talking to the idempotency key/value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// The key/value store cannot be reached
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),

    /// A command was rejected by the key/value store
    #[error("Idempotency command failed: {0}")]
    Command(String),

    /// A cached response could not be encoded or decoded
    #[error("Idempotency serialization failed: {0}")]
    Serialization(String),

    /// The operation exceeded its deadline
    #[error("Idempotency store operation timed out")]
    Timeout,
}

impl IdempotencyError {
    /// Whether the failure is transient (connectivity or deadline).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Key/value store with atomic set-if-absent and per-key expiry.
///
/// Mirrors the command set `SET key value NX PX ttl`, `SET key value PX ttl`,
/// `DEL key`, compare-and-delete and `GET key`.
pub trait IdempotencyStore: Send + Sync {
    /// Atomically set `key` to `value` with `ttl` if and only if it is absent.
    ///
    /// Returns `None` when the value was set, or the current value when the
    /// key already existed. The check and the set must be one atomic step on
    /// the server; a read followed by a write is not acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the command fails.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<String>, IdempotencyError>> + Send;

    /// Unconditionally set `key` to `value` with `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the command fails.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), IdempotencyError>> + Send;

    /// Delete `key`. Deleting an absent key is not an error.
    ///
    /// The guard releases through [`delete_if_equals`](Self::delete_if_equals);
    /// this unconditional form is for clearing a stuck token by hand.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the command fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), IdempotencyError>> + Send;

    /// Atomically delete `key` only if it currently holds `expected`.
    ///
    /// Returns whether the key was deleted. Like
    /// [`set_if_absent`](Self::set_if_absent) this must be one atomic step on
    /// the server.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the command fails.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, IdempotencyError>> + Send;

    /// Read the current value of `key`.
    ///
    /// The guard never reads without setting; this exists for inspecting
    /// stored state in diagnostics and tests.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the command fails.
    fn get(&self, key: &str)
    -> impl Future<Output = Result<Option<String>, IdempotencyError>> + Send;
}
