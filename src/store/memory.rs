//! In-process store adapter backing the test suite.
//!
//! Implements the full [`StoreConnection`] surface over a shared map with
//! glob-matched cursor scans and key expiry, plus switchable fault
//! injection so retry and circuit-breaker behavior can be driven
//! deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::connection::{ConnectionProvider, StoreConnection};
use crate::store::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory store. Cloning yields another handle to the same data,
/// so one instance can serve many pooled connections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    /// Remaining injected failures: 0 = healthy, n > 0 = next n commands
    /// fail, -1 = fail until reset.
    injected_failures: Arc<AtomicI64>,
    commands_seen: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Fail the next `n` commands with a command error.
    pub fn inject_failures(&self, n: i64) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every command until [`MemoryStore::heal`] is called.
    pub fn fail_permanently(&self) {
        self.injected_failures.store(-1, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.injected_failures.store(0, Ordering::SeqCst);
    }

    /// Number of commands served, including injected failures.
    pub fn commands_seen(&self) -> u64 {
        self.commands_seen.load(Ordering::SeqCst)
    }

    /// Direct read of a string key, bypassing fault injection; test helper.
    pub fn peek(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.expired() => match &entry.value {
                Value::Str(s) => Some(s.clone()),
                Value::Hash(_) => None,
            },
            _ => None,
        }
    }

    fn tick(&self) -> Result<(), StoreError> {
        self.commands_seen.fetch_add(1, Ordering::SeqCst);
        let remaining = self.injected_failures.load(Ordering::SeqCst);
        if remaining != 0 {
            if remaining > 0 {
                self.injected_failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(StoreError::Command("injected failure".to_string()));
        }
        Ok(())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.expired());
        f(&mut entries)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }
}

/// One pooled handle onto a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type()),
            None => Ok(None),
        })
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn set_with_ttl(
        &mut self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn del(&mut self, key: &str) -> Result<i64, StoreError> {
        self.store.tick()?;
        Ok(self
            .store
            .with_entries(|entries| entries.remove(key).map(|_| 1).unwrap_or(0)))
    }

    async fn exists(&mut self, key: &str) -> Result<i64, StoreError> {
        self.store.tick()?;
        Ok(self
            .store
            .with_entries(|entries| i64::from(entries.contains_key(key))))
    }

    async fn incrby(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });
            let Value::Str(current) = &mut entry.value else {
                return Err(wrong_type());
            };
            let parsed = current
                .parse::<i64>()
                .map_err(|_| StoreError::Command("value is not an integer".to_string()))?;
            let next = parsed + delta;
            *current = next.to_string();
            Ok(next)
        })
    }

    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type());
            };
            let current = hash.entry(field.to_string()).or_insert_with(|| "0".to_string());
            let parsed = current
                .parse::<i64>()
                .map_err(|_| StoreError::Command("hash value is not an integer".to_string()))?;
            let next = parsed + delta;
            *current = next.to_string();
            Ok(next)
        })
    }

    async fn hdel(&mut self, key: &str, fields: &[String]) -> Result<i64, StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(0);
            };
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type());
            };
            let mut removed = 0;
            for field in fields {
                if hash.remove(field).is_some() {
                    removed += 1;
                }
            }
            if hash.is_empty() {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.store.tick()?;
        self.store.with_entries(|entries| match entries.get(key) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type()),
            None => Ok(HashMap::new()),
        })
    }

    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.store.tick()?;
        Ok(self.store.with_entries(|entries| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(k.as_bytes(), pattern.as_bytes(), 0, 0))
                .cloned()
                .collect();
            keys.sort();
            keys
        }))
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.store.tick()?;
        let count = count.max(1);
        Ok(self.store.with_entries(|entries| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(k.as_bytes(), pattern.as_bytes(), 0, 0))
                .cloned()
                .collect();
            // sorted order keeps cursor iteration deterministic
            keys.sort();

            let page: Vec<String> = keys
                .into_iter()
                .skip(cursor as usize)
                .take(count + 1)
                .collect();

            if page.len() > count {
                (cursor + count as u64, page[..count].to_vec())
            } else {
                (0, page)
            }
        }))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.store.tick()
    }
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Redis-style glob match: `*` any run, `?` one byte, everything else
/// literal.
fn glob_match(key: &[u8], pattern: &[u8], k: usize, p: usize) -> bool {
    if p >= pattern.len() {
        return k >= key.len();
    }

    match pattern[p] {
        b'*' => (k..=key.len()).any(|i| glob_match(key, pattern, i, p + 1)),
        b'?' => k < key.len() && glob_match(key, pattern, k + 1, p + 1),
        literal => k < key.len() && key[k] == literal && glob_match(key, pattern, k + 1, p + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn conn(store: &MemoryStore) -> Box<dyn StoreConnection> {
        store.connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_get_set_del_exists() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        assert_eq!(c.get("k").await.unwrap(), None);
        c.set("k", "v").await.unwrap();
        assert_eq!(c.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(c.exists("k").await.unwrap(), 1);
        assert_eq!(c.del("k").await.unwrap(), 1);
        assert_eq!(c.exists("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incrby_creates_and_accumulates() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        assert_eq!(c.incrby("n", 5).await.unwrap(), 5);
        assert_eq!(c.incrby("n", -2).await.unwrap(), 3);
        assert_eq!(c.get("n").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        c.hincrby("h", "a", 3).await.unwrap();
        c.hincrby("h", "b", 4).await.unwrap();
        let all = c.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], "3");

        assert_eq!(c.hdel("h", &["a".to_string()]).await.unwrap(), 1);
        assert_eq!(c.hgetall("h").await.unwrap().len(), 1);

        // deleting the last field removes the key entirely
        c.hdel("h", &["b".to_string()]).await.unwrap();
        assert_eq!(c.exists("h").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_command_error() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        c.set("s", "x").await.unwrap();
        let err = c.hincrby("s", "f", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
        assert!(!err.is_connection_fatal());
    }

    #[tokio::test]
    async fn test_ttl_expires_keys() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        c.set_with_ttl("short", "1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(c.exists("short").await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(c.exists("short").await.unwrap(), 0);
        assert_eq!(c.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_pages_through_all_matches() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        for i in 0..25 {
            c.set(&format!("counter:ns:c{i:02}:deltas"), "1")
                .await
                .unwrap();
        }
        c.set("unrelated", "1").await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = c.scan(cursor, "counter:ns:*:deltas*", 10).await.unwrap();
            assert!(keys.len() <= 10);
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);

        // the legacy unbounded lookup sees the same key set at once
        let all = c.keys("counter:ns:*:deltas*").await.unwrap();
        assert_eq!(all.len(), 25);
    }

    #[tokio::test]
    async fn test_glob_patterns() {
        assert!(glob_match(b"counter:ns:c:deltas", b"counter:ns:*:deltas", 0, 0));
        assert!(glob_match(
            b"counter:ns:c:deltas:node-a",
            b"counter:ns:*:deltas*",
            0,
            0
        ));
        assert!(!glob_match(
            b"counter:other:c:deltas",
            b"counter:ns:*:deltas",
            0,
            0
        ));
        assert!(glob_match(b"abc", b"a?c", 0, 0));
        assert!(!glob_match(b"abc", b"a?d", 0, 0));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        let mut c = conn(&store).await;

        store.inject_failures(2);
        assert!(c.ping().await.is_err());
        assert!(c.ping().await.is_err());
        assert!(c.ping().await.is_ok());

        store.fail_permanently();
        assert!(c.ping().await.is_err());
        store.heal();
        assert!(c.ping().await.is_ok());
    }
}
