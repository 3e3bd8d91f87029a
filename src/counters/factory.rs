//! Strategy construction: consistency level × execution mode.

use std::sync::Arc;

use crate::core::{AsyncCounter, Consistency, Counter, CounterError};
use crate::counters::accurate::{AccurateAsyncCounter, AccurateCounter};
use crate::counters::best_effort::{BestEffortAsyncCounter, BestEffortCounter};
use crate::counters::eventual::{EventuallyConsistentAsyncCounter, EventuallyConsistentCounter};
use crate::store::StoreManager;

/// Whether a counter runs on the caller's thread or returns futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Blocking,
    NonBlocking,
}

/// A constructed counter tagged with the contract it satisfies, so the
/// rollup scheduler factory can match its execution mode.
pub enum CounterHandle {
    Blocking(Box<dyn Counter>),
    NonBlocking(Box<dyn AsyncCounter>),
}

impl CounterHandle {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            CounterHandle::Blocking(_) => ExecutionMode::Blocking,
            CounterHandle::NonBlocking(_) => ExecutionMode::NonBlocking,
        }
    }
}

/// Builds the six strategy variants. The eventually-consistent and
/// accurate strategies identify the writing process by `node_id` and fail
/// construction without one.
pub struct CounterFactory;

impl CounterFactory {
    /// Create a blocking counter with the given consistency.
    pub fn counter(
        manager: Arc<StoreManager>,
        consistency: Consistency,
        node_id: Option<&str>,
    ) -> Result<Box<dyn Counter>, CounterError> {
        match consistency {
            Consistency::BestEffort => Ok(Box::new(BestEffortCounter::new(manager))),
            Consistency::EventuallyConsistent => {
                let node_id = require_node_id(node_id, "eventually consistent")?;
                Ok(Box::new(EventuallyConsistentCounter::new(manager, node_id)?))
            }
            Consistency::Accurate => {
                let node_id = require_node_id(node_id, "accurate")?;
                Ok(Box::new(AccurateCounter::new(manager, node_id)?))
            }
        }
    }

    /// Create a non-blocking counter with the given consistency.
    pub fn async_counter(
        manager: Arc<StoreManager>,
        consistency: Consistency,
        node_id: Option<&str>,
    ) -> Result<Box<dyn AsyncCounter>, CounterError> {
        match consistency {
            Consistency::BestEffort => Ok(Box::new(BestEffortAsyncCounter::new(manager))),
            Consistency::EventuallyConsistent => {
                let node_id = require_node_id(node_id, "eventually consistent")?;
                Ok(Box::new(EventuallyConsistentAsyncCounter::new(
                    manager, node_id,
                )?))
            }
            Consistency::Accurate => {
                let node_id = require_node_id(node_id, "accurate")?;
                Ok(Box::new(AccurateAsyncCounter::new(manager, node_id)?))
            }
        }
    }

    /// Create a counter tagged with its execution mode.
    pub fn create(
        manager: Arc<StoreManager>,
        consistency: Consistency,
        mode: ExecutionMode,
        node_id: Option<&str>,
    ) -> Result<CounterHandle, CounterError> {
        match mode {
            ExecutionMode::Blocking => {
                Self::counter(manager, consistency, node_id).map(CounterHandle::Blocking)
            }
            ExecutionMode::NonBlocking => {
                Self::async_counter(manager, consistency, node_id).map(CounterHandle::NonBlocking)
            }
        }
    }
}

fn require_node_id<'a>(node_id: Option<&'a str>, strategy: &str) -> Result<&'a str, CounterError> {
    node_id.ok_or_else(|| {
        CounterError::Config(format!("node id is required for the {strategy} counter"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreConfig, StoreManager};

    fn manager() -> Arc<StoreManager> {
        Arc::new(
            StoreManager::blocking_with_provider(
                StoreConfig::test(),
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_best_effort_needs_no_node_id() {
        let counter = CounterFactory::counter(manager(), Consistency::BestEffort, None);
        assert!(counter.is_ok());
    }

    #[test]
    fn test_node_bound_strategies_require_node_id() {
        let err =
            CounterFactory::counter(manager(), Consistency::EventuallyConsistent, None).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let err = CounterFactory::counter(manager(), Consistency::Accurate, None).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_node_id_must_not_contain_separator() {
        let err = CounterFactory::counter(
            manager(),
            Consistency::Accurate,
            Some("node:a"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_create_tags_the_mode() {
        let handle = CounterFactory::create(
            manager(),
            Consistency::BestEffort,
            ExecutionMode::NonBlocking,
            None,
        )
        .unwrap();
        assert_eq!(handle.mode(), ExecutionMode::NonBlocking);
    }
}
