//! The store-adapter boundary and its RESP/TCP implementation.
//!
//! [`StoreConnection`] is the full command surface the counter engine
//! consumes. [`RespConnection`] speaks RESP2 to a sentinel-discovered
//! primary; the in-process [`crate::store::MemoryStore`] implements the
//! same trait for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::store::config::split_host_port;
use crate::store::resp::{self, RespValue};
use crate::store::sentinel;
use crate::store::stream::MaybeSecureStream;
use crate::store::{StoreConfig, StoreError};

/// One borrowed connection's command surface.
///
/// Absent keys read as zero/empty; integer values travel as decimal
/// strings. `keys` is the legacy unbounded lookup; prefer cursor-based
/// `scan`.
#[async_trait]
pub trait StoreConnection: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Set with a time-to-live after which the store reclaims the key.
    async fn set_with_ttl(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn del(&mut self, key: &str) -> Result<i64, StoreError>;
    async fn exists(&mut self, key: &str) -> Result<i64, StoreError>;
    async fn incrby(&mut self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;
    async fn hdel(&mut self, key: &str, fields: &[String]) -> Result<i64, StoreError>;
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError>;
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;
    async fn ping(&mut self) -> Result<(), StoreError>;
}

/// Produces fresh connections for the pool.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// Alias for the non-blocking command handle handed to
/// [`crate::store::StoreManager::execute_async`] closures.
pub type AsyncCommands = dyn StoreConnection;

/// A RESP2 client connection with per-command timeout.
pub struct RespConnection {
    stream: MaybeSecureStream,
    buffer: BytesMut,
    timeout: Duration,
}

impl RespConnection {
    /// Connect to `host:port` without authenticating.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let stream = MaybeSecureStream::connect(host, port, tls).await?;
        Ok(RespConnection {
            stream,
            buffer: BytesMut::with_capacity(4096),
            timeout,
        })
    }

    pub async fn auth(&mut self, password: &str) -> Result<(), StoreError> {
        self.command(&["AUTH", password]).await?.expect_ok()
    }

    /// Issue one command and read one reply, bounded by the configured
    /// timeout. An `-ERR` reply surfaces as [`StoreError::Command`].
    pub(crate) async fn command(&mut self, args: &[&str]) -> Result<RespValue, StoreError> {
        let payload = resp::encode_command(args);
        let reply = tokio::time::timeout(self.timeout, self.round_trip(&payload))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        match reply {
            RespValue::Error(message) => Err(StoreError::Command(message)),
            other => Ok(other),
        }
    }

    async fn round_trip(&mut self, payload: &[u8]) -> Result<RespValue, StoreError> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;

        loop {
            if let Some((value, consumed)) = resp::parse(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by the store",
                )));
            }
        }
    }
}

#[async_trait]
impl StoreConnection for RespConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.command(&["GET", key]).await?.into_optional_string()
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.command(&["SET", key, value]).await?.expect_ok()
    }

    async fn set_with_ttl(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let millis = ttl.as_millis().max(1).to_string();
        self.command(&["SET", key, value, "PX", &millis])
            .await?
            .expect_ok()
    }

    async fn del(&mut self, key: &str) -> Result<i64, StoreError> {
        self.command(&["DEL", key]).await?.into_integer()
    }

    async fn exists(&mut self, key: &str) -> Result<i64, StoreError> {
        self.command(&["EXISTS", key]).await?.into_integer()
    }

    async fn incrby(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let delta = delta.to_string();
        self.command(&["INCRBY", key, &delta]).await?.into_integer()
    }

    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let delta = delta.to_string();
        self.command(&["HINCRBY", key, field, &delta])
            .await?
            .into_integer()
    }

    async fn hdel(&mut self, key: &str, fields: &[String]) -> Result<i64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut args = Vec::with_capacity(fields.len() + 2);
        args.push("HDEL");
        args.push(key);
        args.extend(fields.iter().map(String::as_str));
        self.command(&args).await?.into_integer()
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let items = self.command(&["HGETALL", key]).await?.into_array()?;
        if items.len() % 2 != 0 {
            return Err(StoreError::Protocol(
                "HGETALL reply has an odd number of entries".to_string(),
            ));
        }

        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            let field = field
                .into_optional_string()?
                .ok_or_else(|| StoreError::Protocol("nil hash field".to_string()))?;
            let value = value
                .into_optional_string()?
                .ok_or_else(|| StoreError::Protocol("nil hash value".to_string()))?;
            map.insert(field, value);
        }
        Ok(map)
    }

    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let items = self.command(&["KEYS", pattern]).await?.into_array()?;
        items
            .into_iter()
            .map(|item| {
                item.into_optional_string()?
                    .ok_or_else(|| StoreError::Protocol("nil key in KEYS reply".to_string()))
            })
            .collect()
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let cursor = cursor.to_string();
        let count = count.to_string();
        let mut items = self
            .command(&["SCAN", &cursor, "MATCH", pattern, "COUNT", &count])
            .await?
            .into_array()?;
        if items.len() != 2 {
            return Err(StoreError::Protocol(format!(
                "SCAN reply has {} entries, expected 2",
                items.len()
            )));
        }

        let keys_reply = items.pop();
        let cursor_reply = items.pop();
        let (Some(cursor_reply), Some(keys_reply)) = (cursor_reply, keys_reply) else {
            return Err(StoreError::Protocol("truncated SCAN reply".to_string()));
        };

        let keys = keys_reply
            .into_array()?
            .into_iter()
            .map(|item| {
                item.into_optional_string()?
                    .ok_or_else(|| StoreError::Protocol("nil key in SCAN reply".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = cursor_reply
            .into_optional_string()?
            .and_then(|c| c.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Protocol("malformed SCAN cursor".to_string()))?;

        Ok((next_cursor, keys))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        match self.command(&["PING"]).await? {
            RespValue::SimpleString(_) | RespValue::BulkString(Some(_)) => Ok(()),
            other => Err(StoreError::Protocol(format!(
                "unexpected PING reply: {other:?}"
            ))),
        }
    }
}

/// Provider that discovers the primary through sentinels, then connects
/// and authenticates.
pub struct RespProvider {
    config: StoreConfig,
}

impl RespProvider {
    pub fn new(config: StoreConfig) -> Self {
        RespProvider { config }
    }
}

#[async_trait]
impl ConnectionProvider for RespProvider {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let primary = sentinel::discover_primary(&self.config).await?;
        let (host, port) = split_host_port(&primary)
            .ok_or_else(|| StoreError::Discovery(format!("invalid primary address: {primary}")))?;

        let mut conn = RespConnection::connect(
            host,
            port,
            self.config.tls_enabled,
            self.config.command_timeout,
        )
        .await?;

        if let Some(password) = &self.config.password {
            if !password.is_empty() {
                conn.auth(password).await?;
            }
        }
        conn.ping().await?;
        debug!(primary = %primary, tls = conn.stream.is_tls(), "connected to primary");
        Ok(Box::new(conn))
    }
}
