//! The `error` module defines the error type shared by the store, broker and
//! mailbox layers.
//!
//! Store failures surface unchanged through the broker and mailbox wrappers,
//! so callers match on a single enum regardless of which layer rejected the
//! call.

use thiserror::Error;

use crate::broker::message::MessageStatus;

pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// No record with this id exists in the attached store.
    #[error("message `{0}` not found")]
    NotFound(String),

    /// A status or query operation was issued on a broker without a store.
    #[error("no message store attached to broker")]
    NoStoreAttached,

    /// Broadcasts are routed by topic, so one is mandatory.
    #[error("broadcast message requires a topic")]
    InvalidBroadcast,

    /// Direct sends need at least one explicit recipient.
    #[error("direct message requires at least one recipient")]
    NoRecipients,

    #[error("message `{id}` cannot move from {from} to {to}")]
    InvalidStatusTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// The durable backend cannot run in this environment.
    #[error("storage environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    /// A caller-supplied handler failed during dispatch. Only ever logged.
    #[error("handler on {channel} failed: {reason}")]
    Handler { channel: String, reason: String },

    #[error("mailbox for `{0}` is closed")]
    MailboxClosed(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
