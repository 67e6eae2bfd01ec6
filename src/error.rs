//! Error types for the order sync core.

use thiserror::Error;

use crate::models::OrderStatus;

/// Result type used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the local store, the remote client and the engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// An operation referenced an order id that does not exist locally.
    #[error("order {0} not found")]
    NotFound(String),

    /// A status change would move the order backwards.
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// The remote store call failed.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// An explicit sync was requested while disconnected.
    #[error("cannot sync while offline")]
    Offline,

    /// Local database failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stored row could not be decoded.
    #[error("corrupt local record: {0}")]
    Corrupt(String),

    /// A mutex guarding local state was poisoned.
    #[error("local store lock poisoned")]
    Lock,
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the failure was reported by the remote side.
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::Lock
    }
}
