//! Error taxonomy of the write path and the relay path.
//!
//! | Error | Raised by | Consequence |
//! |-------|-----------|-------------|
//! | [`CreateOrderError::LockContention`] | guard | reject, store untouched |
//! | [`WriteError`] | writer | full rollback, idempotency lock released |
//! | [`PublishError`] | relay | whole batch rolled back, retried next tick |
//! | `Unavailable` / `Timeout` variants | any | transient, retried by timer or client |

use crate::channel::ChannelError;
use crate::idempotency::IdempotencyError;
use crate::order::OutboxId;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Step of the transactional write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStage {
    /// Opening the transaction
    Begin,
    /// Inserting the order
    InsertOrder,
    /// Serializing the event payload
    Marshal,
    /// Inserting the outbox record
    InsertOutbox,
    /// Committing
    Commit,
}

impl WriteStage {
    /// Stable label, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::InsertOrder => "insert_order",
            Self::Marshal => "marshal",
            Self::InsertOutbox => "insert_outbox",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the transactional writer. Always accompanied by a full rollback.
#[derive(Error, Debug)]
pub enum WriteError {
    /// A store step failed
    #[error("Order write failed at {stage}: {source}")]
    Store {
        /// The step that failed
        stage: WriteStage,
        /// Underlying store error
        source: StoreError,
    },

    /// The outbox payload could not be serialized
    #[error("Order write failed at marshal: {0}")]
    Marshal(#[from] serde_json::Error),
}

impl WriteError {
    /// Build a store failure for `stage`.
    #[must_use]
    pub const fn store(stage: WriteStage, source: StoreError) -> Self {
        Self::Store { stage, source }
    }

    /// The step that failed.
    #[must_use]
    pub const fn stage(&self) -> WriteStage {
        match self {
            Self::Store { stage, .. } => *stage,
            Self::Marshal(_) => WriteStage::Marshal,
        }
    }

    /// Whether the failure is transient (connectivity or deadline).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.is_transient(),
            Self::Marshal(_) => false,
        }
    }
}

/// Failure to publish one outbox record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to publish outbox record {record_id} to '{channel}': {source}")]
pub struct PublishError {
    /// Record whose publish failed
    pub record_id: OutboxId,
    /// Channel it was addressed to
    pub channel: String,
    /// Underlying channel error
    pub source: ChannelError,
}

/// Step of a relay batch that failed on the store side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStage {
    /// Opening the transaction
    Begin,
    /// Locking pending rows
    Select,
    /// Updating a row to processed
    MarkProcessed,
    /// Committing
    Commit,
}

impl RelayStage {
    /// Stable label, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Select => "select",
            Self::MarkProcessed => "mark_processed",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one relay batch. The batch transaction never commits partially.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A store step failed
    #[error("Relay batch failed at {stage}: {source}")]
    Store {
        /// The step that failed
        stage: RelayStage,
        /// Underlying store error
        source: StoreError,
    },

    /// A publish failed; the whole batch was aborted
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl RelayError {
    /// Stable label of the failure, used as a metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Store { stage, .. } => stage.as_str(),
            Self::Publish(_) => "publish",
        }
    }
}

/// Observable outcome of a failed create-order request.
#[derive(Error, Debug)]
pub enum CreateOrderError {
    /// A request with the same token is already in flight. Not a failure: the
    /// client should retry shortly.
    #[error("A request with this idempotency token is already in flight")]
    LockContention,

    /// The write failed and was rolled back; the token was released so the
    /// client may resend it.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The idempotency store failed.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}
