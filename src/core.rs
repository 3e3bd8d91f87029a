//! The counter contract: consistency levels, the result value, the error
//! type, and the blocking/non-blocking counter traits.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::token::IdempotencyToken;

/// Error code attached to every infrastructure failure surfaced by a
/// counter operation. Part of the public contract.
pub const REDIS_ERROR: &str = "REDIS_ERROR";

/// Consistency level a counter implementation provides.
///
/// - `BestEffort`: the raw atomic-increment result, no global ordering.
/// - `EventuallyConsistent`: reads may lag writes, values converge through
///   the periodic rollup.
/// - `Accurate`: the value is correct at the result's timestamp, via
///   read-time reconciliation of pending deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consistency {
    BestEffort,
    EventuallyConsistent,
    Accurate,
}

/// Immutable value observed by a counter operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterResult {
    value: i64,
    timestamp: SystemTime,
    consistency: Consistency,
    token: Option<IdempotencyToken>,
}

impl CounterResult {
    pub(crate) fn new(
        value: i64,
        consistency: Consistency,
        token: Option<IdempotencyToken>,
    ) -> Self {
        CounterResult {
            value,
            timestamp: SystemTime::now(),
            consistency,
            token,
        }
    }

    /// The observed counter value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// The instant this result was assembled.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// The idempotency token of the mutation that produced this result.
    pub fn token(&self) -> Option<&IdempotencyToken> {
        self.token.as_ref()
    }
}

impl fmt::Display for CounterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CounterResult(value={}, consistency={:?}, token={})",
            self.value,
            self.consistency,
            self.token
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }
}

/// Error surfaced by counter operations and construction.
#[derive(Debug, Error)]
pub enum CounterError {
    /// Rejected at the entry point; the backing store was never reached.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Construction-time failure: missing node id, bad pool sizing, …
    #[error("configuration error: {0}")]
    Config(String),

    /// Infrastructure failure talking to the backing store, after the
    /// configured retries.
    #[error("{message} [{code}]")]
    Store {
        message: String,
        code: &'static str,
        #[source]
        source: StoreError,
    },
}

impl CounterError {
    pub(crate) fn store(message: impl Into<String>, source: StoreError) -> Self {
        CounterError::Store {
            message: message.into(),
            code: REDIS_ERROR,
            source,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            CounterError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CounterError::Config(_) => "CONFIG_ERROR",
            CounterError::Store { code, .. } => code,
        }
    }
}

/// A distributed counter, blocking form.
///
/// Operations run on the caller's thread and block on connection borrow,
/// command I/O and retry waits. Implementations are safe for concurrent
/// use; writers on the same counter coordinate only through backing-store
/// atomics.
///
/// When a mutation carries an [`IdempotencyToken`], repeated calls with the
/// same token are applied at most once: a pre-existing marker means the
/// mutation is skipped and the current value is returned.
pub trait Counter: Send + Sync {
    /// Apply `delta` to the counter. Fire-and-forget: no value is returned.
    fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError>;

    /// Apply `delta` and return the strategy's view after application.
    fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError>;

    /// Read the current value. Never mutates state, except that the
    /// accurate strategy reconciles pending deltas.
    fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError>;

    /// Reset the counter to zero and drop any delta accumulator.
    /// Idempotency markers are left to expire on their own.
    fn clear(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError>;

    fn increment(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add(namespace, counter, 1, token)
    }

    fn decrement(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add(namespace, counter, -1, token)
    }
}

impl fmt::Debug for dyn Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter").finish_non_exhaustive()
    }
}

/// A distributed counter, non-blocking form.
///
/// Operations resolve on the store client's I/O task; callers must not
/// assume a completion thread. Dropping a returned future cancels the
/// operation without leaking the borrowed connection.
#[async_trait]
pub trait AsyncCounter: Send + Sync {
    async fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError>;

    async fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError>;

    async fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError>;

    async fn clear(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError>;

    async fn increment(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add(namespace, counter, 1, token).await
    }

    async fn decrement(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add(namespace, counter, -1, token).await
    }
}
