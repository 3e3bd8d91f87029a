//! Bounded connection pool.
//!
//! A semaphore caps the number of connections in flight; idle connections
//! wait in a lock-free queue. Borrowing tests the connection with PING and
//! replaces dead ones; returning happens through the guard's `Drop`, so a
//! cancelled caller can never leak a connection. Connections flagged
//! broken after a transport error are discarded instead of re-queued.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::store::connection::{ConnectionProvider, StoreConnection};
use crate::store::{PoolConfig, StoreError};

pub struct ConnectionPool {
    provider: Arc<dyn ConnectionProvider>,
    idle: Arc<ArrayQueue<Box<dyn StoreConnection>>>,
    permits: Arc<Semaphore>,
    max_wait: Duration,
}

impl ConnectionPool {
    /// Build the pool and pre-warm `min_idle` connections.
    pub async fn new(
        provider: Arc<dyn ConnectionProvider>,
        config: &PoolConfig,
    ) -> Result<Self, StoreError> {
        let pool = ConnectionPool {
            provider,
            idle: Arc::new(ArrayQueue::new(config.max_idle.max(1))),
            permits: Arc::new(Semaphore::new(config.max_total)),
            max_wait: config.max_wait,
        };

        for _ in 0..config.min_idle {
            let conn = pool.provider.connect().await?;
            let _ = pool.idle.push(conn);
        }

        Ok(pool)
    }

    /// Borrow a connection, waiting at most `max_wait` for capacity.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let permit = timeout(self.max_wait, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| StoreError::PoolExhausted(self.max_wait))?
            .map_err(|_| StoreError::PoolExhausted(self.max_wait))?;

        let conn = match self.idle.pop() {
            Some(mut conn) => {
                // test on borrow: a stale idle connection gets replaced
                if conn.ping().await.is_ok() {
                    conn
                } else {
                    debug!("idle connection failed its borrow test, reconnecting");
                    self.provider.connect().await?
                }
            }
            None => self.provider.connect().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            idle: Arc::clone(&self.idle),
            broken: false,
            _permit: permit,
        })
    }

    /// Drop every idle connection. In-flight guards drain on their own.
    pub fn drain(&self) {
        let mut dropped = 0;
        while self.idle.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "drained idle connections");
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }
}

/// RAII borrow of one pooled connection. Returned to the idle queue on
/// drop unless marked broken or the queue is already at `max_idle`.
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    idle: Arc<ArrayQueue<Box<dyn StoreConnection>>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&mut self) -> &mut (dyn StoreConnection + 'static) {
        let conn = self.conn.as_mut().expect("connection present until drop");
        &mut **conn
    }

    /// Keep this connection out of the pool; the next borrower dials anew.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            warn!("discarding broken store connection");
            return;
        }
        // full queue: let the connection close instead of growing the pool
        let _ = self.idle.push(conn);
    }
}
