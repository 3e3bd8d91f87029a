//! Backing-store access: wire codec, sentinel discovery, connection pool,
//! resilience policy and the manager that ties them together.
//!
//! The store itself is abstracted behind [`StoreConnection`]; the crate
//! ships a RESP/TCP implementation discovered through sentinels and an
//! in-process implementation used by the test suite.

pub mod config;
pub mod connection;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod resilience;
pub mod resp;
pub mod sentinel;
pub mod stream;

mod error;

pub use config::{BreakerPolicy, PoolConfig, RetryPolicy, StoreConfig};
pub use connection::{AsyncCommands, ConnectionProvider, RespConnection, StoreConnection};
pub use error::StoreError;
pub use manager::{StoreManager, SyncCommands};
pub use memory::MemoryStore;
