//! Periodic namespace rollup: folds every delta accumulator in a
//! namespace into its counter's consolidated total and deletes the
//! accumulator.
//!
//! Each tick cursor-scans `counter:<ns>:*:deltas*`, so both the hash
//! layout and the legacy flat layout are swept. Tick failures are logged
//! and the tick is skipped; the next tick retries naturally. The rollup
//! keeps no state of its own: increment-then-delete commutes across runs,
//! and a delta written between the read and the delete is picked up by the
//! following tick.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::counters::{CounterHandle, ExecutionMode};
use crate::keys;
use crate::store::{AsyncCommands, StoreError, StoreManager, SyncCommands};

const SYNC_SCAN_PAGE: usize = 200;
const ASYNC_SCAN_PAGE: usize = 100;

/// Blocking rollup scheduler; ticks run on a dedicated thread.
pub struct RollupScheduler {
    manager: Arc<StoreManager>,
    interval: Duration,
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl RollupScheduler {
    pub fn new(manager: Arc<StoreManager>, interval: Duration) -> Self {
        RollupScheduler {
            manager,
            interval,
            shutdown: None,
            worker: None,
        }
    }

    /// Start periodic rollups for all counters in `namespace`. The first
    /// tick fires one interval from now.
    pub fn start(&mut self, namespace: &str) {
        let (tx, rx) = mpsc::channel();
        let manager = Arc::clone(&self.manager);
        let interval = self.interval;
        let namespace = namespace.to_string();

        let worker = std::thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => run_tick_blocking(&manager, &namespace),
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });

        self.shutdown = Some(tx);
        self.worker = Some(worker);
        info!(interval = ?self.interval, "rollup scheduler started");
    }

    /// Run a single sweep of `namespace` on the calling thread.
    pub fn run_once(&self, namespace: &str) {
        run_tick_blocking(&self.manager, namespace);
    }

    /// Cancel the next tick without interrupting an in-flight one.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        info!("rollup scheduler stopped");
    }
}

/// Non-blocking rollup scheduler; ticks run on a tokio task.
///
/// Per page, the per-key rollups of one tick are issued on a single
/// borrowed connection and the cursor only advances once the whole page
/// has resolved.
pub struct AsyncRollupScheduler {
    manager: Arc<StoreManager>,
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
}

impl AsyncRollupScheduler {
    pub fn new(manager: Arc<StoreManager>, interval: Duration) -> Self {
        AsyncRollupScheduler {
            manager,
            interval,
            shutdown: None,
        }
    }

    /// Start periodic rollups for all counters in `namespace`. The first
    /// tick fires one interval from now.
    pub fn start(&mut self, namespace: &str) {
        let (tx, mut rx) = watch::channel(false);
        let manager = Arc::clone(&self.manager);
        let interval = self.interval;
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => run_tick_async(&manager, &namespace).await,
                    _ = rx.changed() => break,
                }
            }
        });

        self.shutdown = Some(tx);
        info!(interval = ?self.interval, "async rollup scheduler started");
    }

    /// Run a single sweep of `namespace`.
    pub async fn run_once(&self, namespace: &str) {
        run_tick_async(&self.manager, namespace).await;
    }

    /// Cancel the next tick without interrupting an in-flight one.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        info!("async rollup scheduler stopped");
    }
}

/// A started rollup scheduler of either execution mode.
pub enum RollupHandle {
    Blocking(RollupScheduler),
    NonBlocking(AsyncRollupScheduler),
}

impl RollupHandle {
    pub fn start(&mut self, namespace: &str) {
        match self {
            RollupHandle::Blocking(scheduler) => scheduler.start(namespace),
            RollupHandle::NonBlocking(scheduler) => scheduler.start(namespace),
        }
    }

    pub fn shutdown(self) {
        match self {
            RollupHandle::Blocking(scheduler) => scheduler.shutdown(),
            RollupHandle::NonBlocking(scheduler) => scheduler.shutdown(),
        }
    }
}

/// Picks the scheduler variant matching the counter contract in use.
pub struct RollupSchedulerFactory;

impl RollupSchedulerFactory {
    pub fn create(
        manager: Arc<StoreManager>,
        interval: Duration,
        counter: &CounterHandle,
    ) -> RollupHandle {
        match counter.mode() {
            ExecutionMode::Blocking => {
                RollupHandle::Blocking(RollupScheduler::new(manager, interval))
            }
            ExecutionMode::NonBlocking => {
                RollupHandle::NonBlocking(AsyncRollupScheduler::new(manager, interval))
            }
        }
    }
}

fn run_tick_blocking(manager: &StoreManager, namespace: &str) {
    let outcome = manager.execute(|commands| {
        let pattern = keys::namespace_delta_pattern(namespace);
        let mut cursor = 0;
        loop {
            let (next, page) = commands.scan(cursor, &pattern, SYNC_SCAN_PAGE)?;
            for delta_key in &page {
                rollup_single_blocking(commands, namespace, delta_key)?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    });

    if let Err(error) = outcome {
        warn!(namespace, error = %error, "namespace rollup tick failed");
    }
}

fn rollup_single_blocking(
    commands: &mut SyncCommands<'_>,
    namespace: &str,
    delta_key: &str,
) -> Result<(), StoreError> {
    let Some(counter) = keys::counter_name_from_delta_key(delta_key) else {
        warn!(key = %delta_key, "skipping key outside the delta layout");
        return Ok(());
    };

    let sum = if keys::is_hash_delta_key(delta_key) {
        let deltas = commands.hgetall(delta_key)?;
        if deltas.is_empty() {
            return Ok(());
        }
        deltas.values().map(|v| keys::parse_i64(Some(v))).sum()
    } else {
        keys::parse_i64(commands.get(delta_key)?.as_deref())
    };

    if sum != 0 {
        commands.incrby(&keys::total_key(namespace, counter), sum)?;
    }
    commands.del(delta_key)?;
    debug!(sum, key = %delta_key, "rolled up delta accumulator");
    Ok(())
}

async fn run_tick_async(manager: &StoreManager, namespace: &str) {
    let namespace_owned = namespace.to_owned();
    let outcome = manager
        .execute_async(|conn| {
            let namespace = namespace_owned.clone();
            Box::pin(async move {
                let pattern = keys::namespace_delta_pattern(&namespace);
                let mut cursor = 0;
                loop {
                    let (next, page) = conn.scan(cursor, &pattern, ASYNC_SCAN_PAGE).await?;
                    for delta_key in &page {
                        rollup_single_async(conn, &namespace, delta_key).await?;
                    }
                    if next == 0 {
                        return Ok(());
                    }
                    cursor = next;
                }
            })
        })
        .await;

    if let Err(error) = outcome {
        warn!(namespace, error = %error, "namespace rollup tick failed");
    }
}

async fn rollup_single_async(
    conn: &mut AsyncCommands,
    namespace: &str,
    delta_key: &str,
) -> Result<(), StoreError> {
    let Some(counter) = keys::counter_name_from_delta_key(delta_key) else {
        warn!(key = %delta_key, "skipping key outside the delta layout");
        return Ok(());
    };

    let sum = if keys::is_hash_delta_key(delta_key) {
        let deltas = conn.hgetall(delta_key).await?;
        if deltas.is_empty() {
            return Ok(());
        }
        deltas.values().map(|v| keys::parse_i64(Some(v))).sum()
    } else {
        keys::parse_i64(conn.get(delta_key).await?.as_deref())
    };

    if sum != 0 {
        conn.incrby(&keys::total_key(namespace, counter), sum).await?;
    }
    conn.del(delta_key).await?;
    debug!(sum, key = %delta_key, "rolled up delta accumulator");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreConfig};

    fn blocking_manager(store: &MemoryStore) -> Arc<StoreManager> {
        Arc::new(
            StoreManager::blocking_with_provider(StoreConfig::test(), Arc::new(store.clone()))
                .unwrap(),
        )
    }

    fn seed_hash_deltas(manager: &StoreManager, counter: &str, deltas: &[(&str, i64)]) {
        manager
            .execute(|commands| {
                for (node, delta) in deltas {
                    commands.hincrby(&keys::deltas_key("orders", counter), node, *delta)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn read(manager: &StoreManager, key: &str) -> Option<String> {
        manager.execute(|commands| commands.get(key)).unwrap()
    }

    #[test]
    fn test_hash_deltas_fold_into_total() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        seed_hash_deltas(&manager, "count", &[("a", 3), ("b", 4)]);

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");

        assert_eq!(
            read(&manager, &keys::total_key("orders", "count")),
            Some("7".to_string())
        );
        let leftover = manager
            .execute(|commands| commands.hgetall(&keys::deltas_key("orders", "count")))
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_flat_deltas_fold_into_total() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        manager
            .execute(|commands| {
                commands.incrby(&keys::delta_key_for_node("orders", "count", "node-a"), 5)?;
                commands.incrby(&keys::delta_key_for_node("orders", "count", "node-b"), -2)
            })
            .unwrap();

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");

        assert_eq!(
            read(&manager, &keys::total_key("orders", "count")),
            Some("3".to_string())
        );
        assert_eq!(
            read(&manager, &keys::delta_key_for_node("orders", "count", "node-a")),
            None
        );
    }

    #[test]
    fn test_zero_sum_deltas_are_deleted_without_touching_total() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        seed_hash_deltas(&manager, "count", &[("a", 5), ("b", -5)]);

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");

        assert_eq!(read(&manager, &keys::total_key("orders", "count")), None);
        let leftover = manager
            .execute(|commands| commands.hgetall(&keys::deltas_key("orders", "count")))
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_rollup_is_idempotent() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        seed_hash_deltas(&manager, "count", &[("a", 10)]);

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");
        scheduler.run_once("orders");

        assert_eq!(
            read(&manager, &keys::total_key("orders", "count")),
            Some("10".to_string())
        );
    }

    #[test]
    fn test_rollup_sweeps_multiple_counters() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        seed_hash_deltas(&manager, "created", &[("a", 1)]);
        seed_hash_deltas(&manager, "shipped", &[("a", 2)]);
        seed_hash_deltas(&manager, "returned", &[("b", 3)]);

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");

        assert_eq!(
            read(&manager, &keys::total_key("orders", "created")),
            Some("1".to_string())
        );
        assert_eq!(
            read(&manager, &keys::total_key("orders", "shipped")),
            Some("2".to_string())
        );
        assert_eq!(
            read(&manager, &keys::total_key("orders", "returned")),
            Some("3".to_string())
        );
    }

    #[test]
    fn test_rollup_ignores_other_namespaces() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        manager
            .execute(|commands| {
                commands.hincrby(&keys::deltas_key("billing", "invoices"), "a", 9)
            })
            .unwrap();

        let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders");

        let untouched = manager
            .execute(|commands| commands.hgetall(&keys::deltas_key("billing", "invoices")))
            .unwrap();
        assert_eq!(untouched.len(), 1);
    }

    #[test]
    fn test_scheduler_ticks_and_shuts_down() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);
        seed_hash_deltas(&manager, "count", &[("a", 4)]);

        let mut scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_millis(20));
        scheduler.start("orders");
        std::thread::sleep(Duration::from_millis(120));
        scheduler.shutdown();

        assert_eq!(
            read(&manager, &keys::total_key("orders", "count")),
            Some("4".to_string())
        );
    }

    #[test]
    fn test_factory_matches_counter_mode() {
        use crate::core::Consistency;
        use crate::counters::CounterFactory;

        let store = MemoryStore::new();
        let manager = blocking_manager(&store);

        let blocking = CounterFactory::create(
            Arc::clone(&manager),
            Consistency::BestEffort,
            ExecutionMode::Blocking,
            None,
        )
        .unwrap();
        let handle =
            RollupSchedulerFactory::create(Arc::clone(&manager), Duration::from_secs(60), &blocking);
        assert!(matches!(handle, RollupHandle::Blocking(_)));

        let non_blocking = CounterFactory::create(
            Arc::clone(&manager),
            Consistency::BestEffort,
            ExecutionMode::NonBlocking,
            None,
        )
        .unwrap();
        let handle = RollupSchedulerFactory::create(manager, Duration::from_secs(60), &non_blocking);
        assert!(matches!(handle, RollupHandle::NonBlocking(_)));
    }

    #[tokio::test]
    async fn test_async_run_once_folds_deltas() {
        let store = MemoryStore::new();
        let manager = Arc::new(
            StoreManager::with_provider(StoreConfig::test(), Arc::new(store))
                .await
                .unwrap(),
        );
        manager
            .execute_async(|conn| {
                Box::pin(async move {
                    conn.hincrby(&keys::deltas_key("orders", "count"), "a", 6).await
                })
            })
            .await
            .unwrap();

        let scheduler = AsyncRollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
        scheduler.run_once("orders").await;

        let total = manager
            .execute_async(|conn| {
                Box::pin(async move { conn.get(&keys::total_key("orders", "count")).await })
            })
            .await
            .unwrap();
        assert_eq!(total, Some("6".to_string()));
    }
}
