//! Best-effort strategy: one key per counter, mutated with atomic INCRBY.
//!
//! Lowest latency of the three strategies; the value returned by
//! `add_and_get` is exactly the store's post-increment result. No global
//! ordering across writers.

use std::sync::Arc;

use tracing::error;

use crate::core::{AsyncCounter, Consistency, Counter, CounterError, CounterResult};
use crate::counters::{marker_hit_or_set, marker_hit_or_set_async, validate_identifiers};
use crate::keys;
use crate::store::StoreManager;
use crate::token::IdempotencyToken;

pub struct BestEffortCounter {
    manager: Arc<StoreManager>,
}

impl BestEffortCounter {
    pub fn new(manager: Arc<StoreManager>) -> Self {
        BestEffortCounter { manager }
    }
}

impl Counter for BestEffortCounter {
    fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add_and_get(namespace, counter, delta, token).map(|_| ())
    }

    fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        let ttl = self.manager.marker_ttl();
        self.manager
            .execute(|commands| {
                let counter_key = keys::counter_key(namespace, counter);

                if let Some(token) = token {
                    let marker = keys::idempotency_key(namespace, counter, token);
                    if marker_hit_or_set(commands, &marker, ttl)? {
                        let current = keys::parse_i64(commands.get(&counter_key)?.as_deref());
                        return Ok(CounterResult::new(
                            current,
                            Consistency::BestEffort,
                            Some(token.clone()),
                        ));
                    }
                }

                let value = commands.incrby(&counter_key, delta)?;
                Ok(CounterResult::new(
                    value,
                    Consistency::BestEffort,
                    token.cloned(),
                ))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort add failed");
                CounterError::store("failed to add to counter", e)
            })
    }

    fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        self.manager
            .execute(|commands| {
                let value =
                    keys::parse_i64(commands.get(&keys::counter_key(namespace, counter))?.as_deref());
                Ok(CounterResult::new(value, Consistency::BestEffort, None))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort get failed");
                CounterError::store("failed to read counter", e)
            })
    }

    fn clear(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        validate_identifiers(namespace, counter)?;
        let ttl = self.manager.marker_ttl();
        self.manager
            .execute(|commands| {
                if let Some(token) = token {
                    let marker = keys::idempotency_key(namespace, counter, token);
                    if marker_hit_or_set(commands, &marker, ttl)? {
                        return Ok(());
                    }
                }
                commands.set(&keys::counter_key(namespace, counter), "0")
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}

/// Non-blocking twin of [`BestEffortCounter`].
pub struct BestEffortAsyncCounter {
    manager: Arc<StoreManager>,
}

impl BestEffortAsyncCounter {
    pub fn new(manager: Arc<StoreManager>) -> Self {
        BestEffortAsyncCounter { manager }
    }
}

#[async_trait::async_trait]
impl AsyncCounter for BestEffortAsyncCounter {
    async fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        self.add_and_get(namespace, counter, delta, token)
            .await
            .map(|_| ())
    }

    async fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        let ttl = self.manager.marker_ttl();
        let namespace = namespace.to_owned();
        let counter = counter.to_owned();
        let token = token.cloned();
        self.manager
            .execute_async(|conn| {
                let namespace = namespace.clone();
                let counter = counter.clone();
                let token = token.clone();
                Box::pin(async move {
                    let counter_key = keys::counter_key(&namespace, &counter);

                    if let Some(token) = &token {
                        let marker = keys::idempotency_key(&namespace, &counter, token);
                        if marker_hit_or_set_async(conn, &marker, ttl).await? {
                            let current =
                                keys::parse_i64(conn.get(&counter_key).await?.as_deref());
                            return Ok(CounterResult::new(
                                current,
                                Consistency::BestEffort,
                                Some(token.clone()),
                            ));
                        }
                    }

                    let value = conn.incrby(&counter_key, delta).await?;
                    Ok(CounterResult::new(
                        value,
                        Consistency::BestEffort,
                        token,
                    ))
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort add failed");
                CounterError::store("failed to add to counter", e)
            })
    }

    async fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        let namespace = namespace.to_owned();
        let counter = counter.to_owned();
        self.manager
            .execute_async(|conn| {
                let namespace = namespace.clone();
                let counter = counter.clone();
                Box::pin(async move {
                    let value = keys::parse_i64(
                        conn.get(&keys::counter_key(&namespace, &counter)).await?.as_deref(),
                    );
                    Ok(CounterResult::new(value, Consistency::BestEffort, None))
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort get failed");
                CounterError::store("failed to read counter", e)
            })
    }

    async fn clear(
        &self,
        namespace: &str,
        counter: &str,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        validate_identifiers(namespace, counter)?;
        let ttl = self.manager.marker_ttl();
        let namespace = namespace.to_owned();
        let counter = counter.to_owned();
        let token = token.cloned();
        self.manager
            .execute_async(|conn| {
                let namespace = namespace.clone();
                let counter = counter.clone();
                let token = token.clone();
                Box::pin(async move {
                    if let Some(token) = &token {
                        let marker = keys::idempotency_key(&namespace, &counter, token);
                        if marker_hit_or_set_async(conn, &marker, ttl).await? {
                            return Ok(());
                        }
                    }
                    conn.set(&keys::counter_key(&namespace, &counter), "0").await
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "best-effort clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}
