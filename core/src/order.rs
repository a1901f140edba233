//! Business record types.
//!
//! An [`Order`] is immutable once created. It is owned by the durable store;
//! nothing in the engine caches it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| ParseIdError {
                    kind: $kind,
                    reason: e.to_string(),
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of an order.
    OrderId,
    "order id"
);

uuid_id!(
    /// Reference to the user that owns an order.
    UserId,
    "user id"
);

uuid_id!(
    /// Unique identifier of an outbox record, independent of the order id.
    OutboxId,
    "outbox id"
);

/// The business record.
///
/// Serialized as `{"id": ..., "user_id": ..., "amount": ...}`; this JSON is also
/// the payload of the `order.created` event, so subscribers decode the same shape.
///
/// # Example
///
/// ```
/// use outbox_core::order::{Order, UserId};
///
/// let order = Order::new(UserId::new(), 1000);
/// let payload = order.to_event_payload().unwrap();
/// let decoded = Order::from_event_payload(&payload).unwrap();
/// assert_eq!(order, decoded);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identity
    pub id: OrderId,
    /// Owning user
    pub user_id: UserId,
    /// Amount in minor currency units
    pub amount: i64,
}

impl Order {
    /// Create an order with a freshly generated id.
    #[must_use]
    pub fn new(user_id: UserId, amount: i64) -> Self {
        Self {
            id: OrderId::new(),
            user_id,
            amount,
        }
    }

    /// Serialize the order snapshot carried by its creation event.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; with the current field types this cannot
    /// fail in practice, but the writer still treats it as a distinct stage.
    pub fn to_event_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode an order snapshot from an event payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON order.
    pub fn from_event_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_snake_case_field_names() {
        let order = Order::new(UserId::new(), 1000);
        let json: serde_json::Value =
            serde_json::from_slice(&order.to_event_payload().unwrap()).unwrap();

        assert_eq!(json["id"], order.id.to_string());
        assert_eq!(json["user_id"], order.user_id.to_string());
        assert_eq!(json["amount"], 1000);
    }

    #[test]
    fn ids_parse_from_display() {
        let id = OrderId::new();
        let parsed: OrderId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_id_is_rejected() {
        let err = "not-a-uuid".parse::<OutboxId>().unwrap_err();
        assert!(err.to_string().contains("outbox id"));
    }

    #[test]
    fn fresh_orders_get_distinct_ids() {
        let user = UserId::new();
        assert_ne!(Order::new(user, 1).id, Order::new(user, 1).id);
    }
}
