//! Outbox record types.
//!
//! An [`OutboxRecord`] exists if and only if its order was committed: both are
//! written in the same store transaction. Records are created
//! [`OutboxStatus::Pending`] and flipped to [`OutboxStatus::Processed`] exactly
//! once, by a relay worker, after a successful publish. They are never deleted
//! here.

use crate::order::{Order, OutboxId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Event type label (and channel name) of the order creation event.
pub const ORDER_CREATED: &str = "order.created";

/// Error returned when a stored status string is not recognized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid outbox status: {0}")]
pub struct ParseStatusError(String);

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Not yet published (or publish not yet committed)
    Pending,
    /// At least one publish attempt succeeded and was committed
    Processed,
}

impl OutboxStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processed => "PROCESSED",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSED" => Ok(Self::Processed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending or processed event waiting in the outbox table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Record identity
    pub id: OutboxId,
    /// Event type label; also the notification channel it is published on
    pub event_type: String,
    /// Opaque serialized snapshot of the triggering business fact
    pub payload: Vec<u8>,
    /// Delivery status
    pub status: OutboxStatus,
    /// Creation time, used for relay ordering
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Create a new pending record with a fresh identity.
    #[must_use]
    pub fn pending(
        event_type: impl Into<String>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OutboxId::new(),
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            created_at,
        }
    }

    /// Build the `order.created` record for an order.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the order snapshot cannot be encoded.
    pub fn order_created(order: &Order, created_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self::pending(ORDER_CREATED, order.to_event_payload()?, created_at))
    }

    /// Whether the record still awaits a committed publish.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::order::UserId;

    #[test]
    fn status_parses_database_strings() {
        assert_eq!(OutboxStatus::parse("PENDING").unwrap(), OutboxStatus::Pending);
        assert_eq!(OutboxStatus::parse("PROCESSED").unwrap(), OutboxStatus::Processed);
        assert_eq!(OutboxStatus::Processed.to_string(), "PROCESSED");
    }

    #[test]
    fn status_rejects_lowercase() {
        assert!(OutboxStatus::parse("pending").is_err());
    }

    #[test]
    fn order_created_record_is_pending_and_carries_snapshot() {
        let order = Order::new(UserId::new(), 250);
        let record = OutboxRecord::order_created(&order, Utc::now()).unwrap();

        assert!(record.is_pending());
        assert_eq!(record.event_type, ORDER_CREATED);
        assert_eq!(Order::from_event_payload(&record.payload).unwrap(), order);
        assert_ne!(record.id.as_uuid(), order.id.as_uuid());
    }
}
