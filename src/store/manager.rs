//! Pooled, retried, circuit-broken access to the backing store.
//!
//! The manager owns the connection pool and the resilience policy and
//! exposes the two execution primitives everything else is built on:
//! a blocking [`StoreManager::execute`] handing the closure a
//! [`SyncCommands`] handle, and a non-blocking
//! [`StoreManager::execute_async`] handing it the raw async connection.
//! Every execution is decorated with retry first, circuit breaker second;
//! one connection is borrowed per in-flight execution and returned exactly
//! once on every path, including cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use crate::core::CounterError;
use crate::store::connection::{AsyncCommands, ConnectionProvider, RespProvider, StoreConnection};
use crate::store::pool::ConnectionPool;
use crate::store::resilience::CircuitBreaker;
use crate::store::{StoreConfig, StoreError};

enum RuntimeFlavor {
    /// Runtime owned by the manager; created by the `connect_blocking`
    /// constructors so the blocking API works from plain threads.
    Owned(Runtime),
    /// Handle to the caller's runtime; the blocking API must then only be
    /// used from threads outside that runtime.
    Shared(Handle),
}

impl RuntimeFlavor {
    fn handle(&self) -> &Handle {
        match self {
            RuntimeFlavor::Owned(runtime) => runtime.handle(),
            RuntimeFlavor::Shared(handle) => handle,
        }
    }
}

pub struct StoreManager {
    pool: ConnectionPool,
    retry_attempts: u32,
    retry_wait: Duration,
    breaker: CircuitBreaker,
    marker_ttl: Option<Duration>,
    runtime: RuntimeFlavor,
}

impl StoreManager {
    /// Connect through sentinel discovery. Must be called from within a
    /// tokio runtime; use [`StoreManager::connect_blocking`] otherwise.
    pub async fn connect(config: StoreConfig) -> Result<Self, CounterError> {
        config.validate_for_sentinel()?;
        let provider: Arc<dyn ConnectionProvider> = Arc::new(RespProvider::new(config.clone()));
        let handle = Handle::try_current().map_err(|_| {
            CounterError::Config("connect requires a running tokio runtime".to_string())
        })?;
        Self::build(config, provider, RuntimeFlavor::Shared(handle)).await
    }

    /// Connect through sentinel discovery, creating a private runtime so
    /// the blocking API can be used from any plain thread.
    pub fn connect_blocking(config: StoreConfig) -> Result<Self, CounterError> {
        config.validate_for_sentinel()?;
        let provider: Arc<dyn ConnectionProvider> = Arc::new(RespProvider::new(config.clone()));
        Self::build_blocking(config, provider)
    }

    /// Connect against a caller-supplied adapter, e.g. an in-process store
    /// in tests.
    pub async fn with_provider(
        config: StoreConfig,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self, CounterError> {
        config.validate_common()?;
        let handle = Handle::try_current().map_err(|_| {
            CounterError::Config("with_provider requires a running tokio runtime".to_string())
        })?;
        Self::build(config, provider, RuntimeFlavor::Shared(handle)).await
    }

    /// Blocking variant of [`StoreManager::with_provider`].
    pub fn blocking_with_provider(
        config: StoreConfig,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self, CounterError> {
        config.validate_common()?;
        Self::build_blocking(config, provider)
    }

    fn build_blocking(
        config: StoreConfig,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self, CounterError> {
        let runtime = Runtime::new()
            .map_err(|e| CounterError::Config(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(ConnectionPool::new(provider, &config.pool))
            .map_err(|e| CounterError::store("failed to establish store connectivity", e))?;
        Ok(Self::assemble(config, pool, RuntimeFlavor::Owned(runtime)))
    }

    async fn build(
        config: StoreConfig,
        provider: Arc<dyn ConnectionProvider>,
        runtime: RuntimeFlavor,
    ) -> Result<Self, CounterError> {
        let pool = ConnectionPool::new(provider, &config.pool)
            .await
            .map_err(|e| CounterError::store("failed to establish store connectivity", e))?;
        Ok(Self::assemble(config, pool, runtime))
    }

    fn assemble(config: StoreConfig, pool: ConnectionPool, runtime: RuntimeFlavor) -> Self {
        info!(
            sentinels = config.sentinels.len(),
            master = %config.master_name,
            tls = config.tls_enabled,
            "store manager initialized"
        );
        StoreManager {
            pool,
            retry_attempts: config.retry.attempts,
            retry_wait: config.retry.wait,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            marker_ttl: config.marker_ttl,
            runtime,
        }
    }

    /// TTL to attach to idempotency markers.
    pub fn marker_ttl(&self) -> Option<Duration> {
        self.marker_ttl
    }

    /// Run `action` against a borrowed connection, blocking the calling
    /// thread. The action may be invoked once per retry attempt.
    pub fn execute<T>(
        &self,
        action: impl Fn(&mut SyncCommands<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.breaker.try_acquire()?;
        let started = Instant::now();
        let result = self.retry_blocking(&action);
        self.breaker.record(result.is_err(), started.elapsed());
        result
    }

    /// Run `action` against a borrowed connection without blocking. The
    /// connection is released when the returned future resolves or is
    /// dropped; the action may be invoked once per retry attempt.
    pub async fn execute_async<T, F>(&self, action: F) -> Result<T, StoreError>
    where
        F: for<'a> Fn(&'a mut AsyncCommands) -> BoxFuture<'a, Result<T, StoreError>>,
    {
        self.breaker.try_acquire()?;
        let started = Instant::now();
        let result = self.retry_async(&action).await;
        self.breaker.record(result.is_err(), started.elapsed());
        result
    }

    fn retry_blocking<T>(
        &self,
        action: &dyn Fn(&mut SyncCommands<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match self.attempt_blocking(action) {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.retry_attempts => {
                    warn!(attempt, error = %error, "store call failed, retrying");
                    std::thread::sleep(self.retry_wait);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn attempt_blocking<T>(
        &self,
        action: &dyn Fn(&mut SyncCommands<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let handle = self.runtime.handle();
        let mut guard = handle.block_on(self.pool.acquire())?;
        let mut commands = SyncCommands {
            conn: guard.connection(),
            handle,
        };
        let result = action(&mut commands);
        drop(commands);
        if let Err(error) = &result {
            if error.is_connection_fatal() {
                guard.mark_broken();
            }
        }
        result
    }

    async fn retry_async<T, F>(&self, action: &F) -> Result<T, StoreError>
    where
        F: for<'a> Fn(&'a mut AsyncCommands) -> BoxFuture<'a, Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match self.attempt_async(action).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.retry_attempts => {
                    warn!(attempt, error = %error, "store call failed, retrying");
                    tokio::time::sleep(self.retry_wait).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn attempt_async<T, F>(&self, action: &F) -> Result<T, StoreError>
    where
        F: for<'a> Fn(&'a mut AsyncCommands) -> BoxFuture<'a, Result<T, StoreError>>,
    {
        let mut guard = self.pool.acquire().await?;
        let result = action(guard.connection()).await;
        if let Err(error) = &result {
            if error.is_connection_fatal() {
                guard.mark_broken();
            }
        }
        result
    }

    /// Drain the pool and shut down the owned runtime, if any.
    pub fn close(self) {
        self.pool.drain();
        if let RuntimeFlavor::Owned(runtime) = self.runtime {
            runtime.shutdown_background();
        }
        info!("store manager closed");
    }
}

/// Synchronous command handle over one borrowed connection.
///
/// Each method drives the underlying async command to completion on the
/// manager's runtime.
pub struct SyncCommands<'a> {
    conn: &'a mut (dyn StoreConnection + 'static),
    handle: &'a Handle,
}

impl SyncCommands<'_> {
    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.handle.block_on(self.conn.get(key))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.handle.block_on(self.conn.set(key, value))
    }

    pub fn set_with_ttl(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.handle.block_on(self.conn.set_with_ttl(key, value, ttl))
    }

    pub fn del(&mut self, key: &str) -> Result<i64, StoreError> {
        self.handle.block_on(self.conn.del(key))
    }

    pub fn exists(&mut self, key: &str) -> Result<i64, StoreError> {
        self.handle.block_on(self.conn.exists(key))
    }

    pub fn incrby(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.handle.block_on(self.conn.incrby(key, delta))
    }

    pub fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.handle.block_on(self.conn.hincrby(key, field, delta))
    }

    pub fn hdel(&mut self, key: &str, fields: &[String]) -> Result<i64, StoreError> {
        self.handle.block_on(self.conn.hdel(key, fields))
    }

    pub fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.handle.block_on(self.conn.hgetall(key))
    }

    pub fn keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.handle.block_on(self.conn.keys(pattern))
    }

    pub fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.handle.block_on(self.conn.scan(cursor, pattern, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn blocking_manager(store: &MemoryStore) -> StoreManager {
        StoreManager::blocking_with_provider(StoreConfig::test(), Arc::new(store.clone())).unwrap()
    }

    #[test]
    fn test_blocking_execute_roundtrip() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);

        let value = manager
            .execute(|commands| {
                commands.set("k", "41")?;
                commands.incrby("k", 1)
            })
            .unwrap();
        assert_eq!(value, 42);
        manager.close();
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);

        // two injected failures are absorbed within the three attempts
        store.inject_failures(2);
        let value = manager.execute(|commands| commands.incrby("n", 1)).unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_exhausted_retries_surface_the_error() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);

        store.fail_permanently();
        let err = manager
            .execute(|commands| commands.incrby("n", 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
    }

    #[test]
    fn test_breaker_opens_after_sustained_failures() {
        let store = MemoryStore::new();
        let manager = blocking_manager(&store);

        store.fail_permanently();
        for _ in 0..10 {
            let _ = manager.execute(|commands| commands.exists("k"));
        }

        // breaker is now open: fail fast without touching the store
        let seen_before = store.commands_seen();
        let err = manager.execute(|commands| commands.exists("k")).unwrap_err();
        assert!(matches!(err, StoreError::CircuitOpen));
        assert_eq!(store.commands_seen(), seen_before);
    }

    #[tokio::test]
    async fn test_async_execute_roundtrip() {
        let store = MemoryStore::new();
        let manager = StoreManager::with_provider(StoreConfig::test(), Arc::new(store))
            .await
            .unwrap();

        let value = manager
            .execute_async(|conn| {
                Box::pin(async move {
                    conn.set("k", "6").await?;
                    conn.incrby("k", 1).await
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_async_retry_recovers() {
        let store = MemoryStore::new();
        let manager =
            StoreManager::with_provider(StoreConfig::test(), Arc::new(store.clone()))
                .await
                .unwrap();

        store.inject_failures(1);
        let value = manager
            .execute_async(|conn| Box::pin(async move { conn.incrby("n", 5).await }))
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
