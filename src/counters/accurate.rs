//! Accurate strategy: a consolidated snapshot plus a per-node delta hash,
//! reconciled on every read and write.
//!
//! Reconciliation folds the delta fields it actually observed: it
//! increments the snapshot by the observed sum and deletes only those
//! fields, so an increment landing between the read and the delete stays
//! in the hash for the next reconciliation. Convergence, not atomicity.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

use crate::core::{AsyncCounter, Consistency, Counter, CounterError, CounterResult};
use crate::counters::{
    marker_hit_or_set, marker_hit_or_set_async, validate_identifier, validate_identifiers,
};
use crate::keys;
use crate::store::{AsyncCommands, StoreError, StoreManager, SyncCommands};
use crate::token::IdempotencyToken;

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct AccurateCounter {
    manager: Arc<StoreManager>,
    node_id: String,
}

impl AccurateCounter {
    pub fn new(manager: Arc<StoreManager>, node_id: &str) -> Result<Self, CounterError> {
        validate_identifier(node_id, "node id")?;
        Ok(AccurateCounter {
            manager,
            node_id: node_id.to_string(),
        })
    }
}

impl Counter for AccurateCounter {
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
                if let Some(token) = token {
                    let marker = keys::idempotency_key(namespace, counter, token);
                    if marker_hit_or_set(commands, &marker, ttl)? {
                        let value = reconcile(commands, namespace, counter)?;
                        return Ok(CounterResult::new(
                            value,
                            Consistency::Accurate,
                            Some(token.clone()),
                        ));
                    }
                }

                commands.hincrby(&keys::deltas_key(namespace, counter), &self.node_id, delta)?;
                let value = reconcile(commands, namespace, counter)?;
                Ok(CounterResult::new(
                    value,
                    Consistency::Accurate,
                    token.cloned(),
                ))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate add failed");
                CounterError::store("failed to add to counter", e)
            })
    }

    fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        self.manager
            .execute(|commands| {
                let value = reconcile(commands, namespace, counter)?;
                Ok(CounterResult::new(value, Consistency::Accurate, None))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate get failed");
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
                commands.set(&keys::snapshot_key(namespace, counter), "0")?;
                commands.del(&keys::deltas_key(namespace, counter))?;
                Ok(())
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}

/// Fold pending deltas into the snapshot and return the reconciled value.
fn reconcile(
    commands: &mut SyncCommands<'_>,
    namespace: &str,
    counter: &str,
) -> Result<i64, StoreError> {
    let snapshot_key = keys::snapshot_key(namespace, counter);
    let deltas_key = keys::deltas_key(namespace, counter);

    let deltas = commands.hgetall(&deltas_key)?;
    if deltas.is_empty() {
        return Ok(keys::parse_i64(commands.get(&snapshot_key)?.as_deref()));
    }

    let sum: i64 = deltas.values().map(|v| keys::parse_i64(Some(v))).sum();
    let fields: Vec<String> = deltas.into_keys().collect();

    let value = if sum != 0 {
        let value = commands.incrby(&snapshot_key, sum)?;
        commands.set(
            &keys::snapshot_ts_key(namespace, counter),
            &epoch_millis().to_string(),
        )?;
        value
    } else {
        keys::parse_i64(commands.get(&snapshot_key)?.as_deref())
    };

    commands.hdel(&deltas_key, &fields)?;
    Ok(value)
}

/// Non-blocking twin of [`AccurateCounter`].
pub struct AccurateAsyncCounter {
    manager: Arc<StoreManager>,
    node_id: String,
}

impl AccurateAsyncCounter {
    pub fn new(manager: Arc<StoreManager>, node_id: &str) -> Result<Self, CounterError> {
        validate_identifier(node_id, "node id")?;
        Ok(AccurateAsyncCounter {
            manager,
            node_id: node_id.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AsyncCounter for AccurateAsyncCounter {
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
        let node_id = self.node_id.clone();
        self.manager
            .execute_async(|conn| {
                let namespace = namespace.clone();
                let counter = counter.clone();
                let token = token.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    if let Some(token) = &token {
                        let marker = keys::idempotency_key(&namespace, &counter, token);
                        if marker_hit_or_set_async(conn, &marker, ttl).await? {
                            let value = reconcile_async(conn, &namespace, &counter).await?;
                            return Ok(CounterResult::new(
                                value,
                                Consistency::Accurate,
                                Some(token.clone()),
                            ));
                        }
                    }

                    conn.hincrby(&keys::deltas_key(&namespace, &counter), &node_id, delta)
                        .await?;
                    let value = reconcile_async(conn, &namespace, &counter).await?;
                    Ok(CounterResult::new(
                        value,
                        Consistency::Accurate,
                        token,
                    ))
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate add failed");
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
                    let value = reconcile_async(conn, &namespace, &counter).await?;
                    Ok(CounterResult::new(value, Consistency::Accurate, None))
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate get failed");
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
                    conn.set(&keys::snapshot_key(&namespace, &counter), "0").await?;
                    conn.del(&keys::deltas_key(&namespace, &counter)).await?;
                    Ok(())
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "accurate clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}

async fn reconcile_async(
    conn: &mut AsyncCommands,
    namespace: &str,
    counter: &str,
) -> Result<i64, StoreError> {
    let snapshot_key = keys::snapshot_key(namespace, counter);
    let deltas_key = keys::deltas_key(namespace, counter);

    let deltas = conn.hgetall(&deltas_key).await?;
    if deltas.is_empty() {
        return Ok(keys::parse_i64(conn.get(&snapshot_key).await?.as_deref()));
    }

    let sum: i64 = deltas.values().map(|v| keys::parse_i64(Some(v))).sum();
    let fields: Vec<String> = deltas.into_keys().collect();

    let value = if sum != 0 {
        let value = conn.incrby(&snapshot_key, sum).await?;
        conn.set(
            &keys::snapshot_ts_key(namespace, counter),
            &epoch_millis().to_string(),
        )
        .await?;
        value
    } else {
        keys::parse_i64(conn.get(&snapshot_key).await?.as_deref())
    };

    conn.hdel(&deltas_key, &fields).await?;
    Ok(value)
}
