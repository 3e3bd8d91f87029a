//! Eventually-consistent strategy: per-node delta accumulators plus a
//! consolidated total maintained by the periodic rollup.
//!
//! Two delta layouts exist. The hash layout keeps one hash per counter
//! with a field per node, read in a single round trip; prefer it. The flat
//! layout keeps one key per node and pays a cursor scan on every read;
//! it is kept for key-space compatibility with older deployments.
//!
//! `add_and_get` is `add` followed by `get`, so the returned value also
//! includes concurrent writers' contributions. Callers that need "value
//! after my write" should use the accurate strategy.

use std::sync::Arc;

use tracing::error;

use crate::core::{AsyncCounter, Consistency, Counter, CounterError, CounterResult};
use crate::counters::{
    marker_hit_or_set, marker_hit_or_set_async, validate_identifier, validate_identifiers,
    SCAN_PAGE,
};
use crate::keys;
use crate::store::{AsyncCommands, StoreError, StoreManager, SyncCommands};
use crate::token::IdempotencyToken;

/// How per-node pending deltas are laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaLayout {
    /// One hash per counter, one field per node. Reads are O(1) round
    /// trips.
    #[default]
    Hash,
    /// One key per node. Reads scan the key space; legacy.
    Flat,
}

pub struct EventuallyConsistentCounter {
    manager: Arc<StoreManager>,
    node_id: String,
    layout: DeltaLayout,
}

impl EventuallyConsistentCounter {
    pub fn new(manager: Arc<StoreManager>, node_id: &str) -> Result<Self, CounterError> {
        Self::with_layout(manager, node_id, DeltaLayout::default())
    }

    pub fn with_layout(
        manager: Arc<StoreManager>,
        node_id: &str,
        layout: DeltaLayout,
    ) -> Result<Self, CounterError> {
        validate_identifier(node_id, "node id")?;
        Ok(EventuallyConsistentCounter {
            manager,
            node_id: node_id.to_string(),
            layout,
        })
    }
}

impl Counter for EventuallyConsistentCounter {
    fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
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
                match self.layout {
                    DeltaLayout::Hash => commands
                        .hincrby(&keys::deltas_key(namespace, counter), &self.node_id, delta)
                        .map(|_| ()),
                    DeltaLayout::Flat => commands
                        .incrby(
                            &keys::delta_key_for_node(namespace, counter, &self.node_id),
                            delta,
                        )
                        .map(|_| ()),
                }
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent add failed");
                CounterError::store("failed to add delta", e)
            })
    }

    fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError> {
        self.add(namespace, counter, delta, token)?;
        let observed = self.get(namespace, counter)?;
        Ok(CounterResult::new(
            observed.value(),
            Consistency::EventuallyConsistent,
            token.cloned(),
        ))
    }

    fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        self.manager
            .execute(|commands| {
                let total =
                    keys::parse_i64(commands.get(&keys::total_key(namespace, counter))?.as_deref());
                let pending = match self.layout {
                    DeltaLayout::Hash => {
                        sum_hash_deltas(commands, &keys::deltas_key(namespace, counter))?
                    }
                    DeltaLayout::Flat => {
                        sum_flat_deltas(commands, &keys::flat_delta_pattern(namespace, counter))?
                    }
                };
                Ok(CounterResult::new(
                    total + pending,
                    Consistency::EventuallyConsistent,
                    None,
                ))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent get failed");
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
                commands.set(&keys::total_key(namespace, counter), "0")?;
                // drop both layouts so a cleared counter reads zero no
                // matter which layout wrote the deltas
                commands.del(&keys::deltas_key(namespace, counter))?;
                delete_matching(commands, &keys::flat_delta_pattern(namespace, counter))
            })
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}

fn sum_hash_deltas(commands: &mut SyncCommands<'_>, deltas_key: &str) -> Result<i64, StoreError> {
    let deltas = commands.hgetall(deltas_key)?;
    Ok(deltas.values().map(|v| keys::parse_i64(Some(v))).sum())
}

fn sum_flat_deltas(commands: &mut SyncCommands<'_>, pattern: &str) -> Result<i64, StoreError> {
    let mut sum = 0;
    let mut cursor = 0;
    loop {
        let (next, page) = commands.scan(cursor, pattern, SCAN_PAGE)?;
        for key in &page {
            sum += keys::parse_i64(commands.get(key)?.as_deref());
        }
        if next == 0 {
            return Ok(sum);
        }
        cursor = next;
    }
}

fn delete_matching(commands: &mut SyncCommands<'_>, pattern: &str) -> Result<(), StoreError> {
    // collect first: deleting while the cursor walks would skip keys
    let mut matched = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, page) = commands.scan(cursor, pattern, SCAN_PAGE)?;
        matched.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    for key in &matched {
        commands.del(key)?;
    }
    Ok(())
}

/// Non-blocking twin of [`EventuallyConsistentCounter`].
pub struct EventuallyConsistentAsyncCounter {
    manager: Arc<StoreManager>,
    node_id: String,
    layout: DeltaLayout,
}

impl EventuallyConsistentAsyncCounter {
    pub fn new(manager: Arc<StoreManager>, node_id: &str) -> Result<Self, CounterError> {
        Self::with_layout(manager, node_id, DeltaLayout::default())
    }

    pub fn with_layout(
        manager: Arc<StoreManager>,
        node_id: &str,
        layout: DeltaLayout,
    ) -> Result<Self, CounterError> {
        validate_identifier(node_id, "node id")?;
        Ok(EventuallyConsistentAsyncCounter {
            manager,
            node_id: node_id.to_string(),
            layout,
        })
    }
}

#[async_trait::async_trait]
impl AsyncCounter for EventuallyConsistentAsyncCounter {
    async fn add(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<(), CounterError> {
        validate_identifiers(namespace, counter)?;
        let ttl = self.manager.marker_ttl();
        let layout = self.layout;
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
                            return Ok(());
                        }
                    }
                    match layout {
                        DeltaLayout::Hash => {
                            conn.hincrby(&keys::deltas_key(&namespace, &counter), &node_id, delta)
                                .await
                                .map(|_| ())
                        }
                        DeltaLayout::Flat => {
                            conn.incrby(
                                &keys::delta_key_for_node(&namespace, &counter, &node_id),
                                delta,
                            )
                            .await
                            .map(|_| ())
                        }
                    }
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent add failed");
                CounterError::store("failed to add delta", e)
            })
    }

    async fn add_and_get(
        &self,
        namespace: &str,
        counter: &str,
        delta: i64,
        token: Option<&IdempotencyToken>,
    ) -> Result<CounterResult, CounterError> {
        self.add(namespace, counter, delta, token).await?;
        let observed = self.get(namespace, counter).await?;
        Ok(CounterResult::new(
            observed.value(),
            Consistency::EventuallyConsistent,
            token.cloned(),
        ))
    }

    async fn get(&self, namespace: &str, counter: &str) -> Result<CounterResult, CounterError> {
        validate_identifiers(namespace, counter)?;
        let layout = self.layout;
        let namespace = namespace.to_owned();
        let counter = counter.to_owned();
        self.manager
            .execute_async(|conn| {
                let namespace = namespace.clone();
                let counter = counter.clone();
                Box::pin(async move {
                    let total = keys::parse_i64(
                        conn.get(&keys::total_key(&namespace, &counter)).await?.as_deref(),
                    );
                    let pending = match layout {
                        DeltaLayout::Hash => {
                            let deltas = conn.hgetall(&keys::deltas_key(&namespace, &counter)).await?;
                            deltas.values().map(|v| keys::parse_i64(Some(v))).sum()
                        }
                        DeltaLayout::Flat => {
                            sum_flat_deltas_async(
                                conn,
                                &keys::flat_delta_pattern(&namespace, &counter),
                            )
                            .await?
                        }
                    };
                    Ok(CounterResult::new(
                        total + pending,
                        Consistency::EventuallyConsistent,
                        None,
                    ))
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent get failed");
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
                    conn.set(&keys::total_key(&namespace, &counter), "0").await?;
                    conn.del(&keys::deltas_key(&namespace, &counter)).await?;
                    delete_matching_async(conn, &keys::flat_delta_pattern(&namespace, &counter)).await
                })
            })
            .await
            .map_err(|e| {
                error!(namespace, counter, error = %e, "eventually-consistent clear failed");
                CounterError::store("failed to clear counter", e)
            })
    }
}

async fn sum_flat_deltas_async(conn: &mut AsyncCommands, pattern: &str) -> Result<i64, StoreError> {
    let mut sum = 0;
    let mut cursor = 0;
    loop {
        let (next, page) = conn.scan(cursor, pattern, SCAN_PAGE).await?;
        for key in &page {
            sum += keys::parse_i64(conn.get(key).await?.as_deref());
        }
        if next == 0 {
            return Ok(sum);
        }
        cursor = next;
    }
}

async fn delete_matching_async(conn: &mut AsyncCommands, pattern: &str) -> Result<(), StoreError> {
    let mut matched = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, page) = conn.scan(cursor, pattern, SCAN_PAGE).await?;
        matched.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    for key in &matched {
        conn.del(key).await?;
    }
    Ok(())
}
