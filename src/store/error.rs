//! Store-layer error type.

use std::time::Duration;

use thiserror::Error;

/// Failure talking to the backing store or its discovery layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not parse as a RESP reply, or a reply
    /// of an unexpected shape for the command issued.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store answered with an error reply.
    #[error("command failed: {0}")]
    Command(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("sentinel discovery failed: {0}")]
    Discovery(String),

    #[error("no pooled connection available within {0:?}")]
    PoolExhausted(Duration),

    /// The circuit breaker is open; the call failed fast without touching
    /// the store.
    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl StoreError {
    /// Whether the connection that produced this error can no longer be
    /// trusted and must not return to the pool. Command errors leave the
    /// connection usable; transport and framing errors do not.
    pub(crate) fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Protocol(_) | StoreError::Timeout(_)
        )
    }
}
