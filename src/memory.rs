//! In-process counter store and lock backend.
//!
//! Used for local runs without Redis and throughout the tests. Keys enumerate
//! in lexical order.

use crate::error::{CounterError, Result};
use crate::lock::InstanceLock;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct MemoryStore {
    counters: Arc<RwLock<BTreeMap<String, i64>>>,
    locks: Arc<RwLock<HashMap<String, Lease>>>,
}

#[derive(Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a counter directly, bypassing increment semantics.
    pub fn insert(&self, key: &str, value: i64) -> Result<()> {
        let mut counters = self.counters.write().map_err(|_| poisoned())?;
        counters.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.counters.read().ok()?.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.counters.read().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token currently holding `name`, if its lease is live.
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let locks = self.locks.read().ok()?;
        locks
            .get(name)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.token.clone())
    }

    #[cfg(test)]
    pub(crate) fn steal_lock(&self, name: &str, token: &str, lease: Duration) {
        if let Ok(mut locks) = self.locks.write() {
            locks.insert(
                name.to_string(),
                Lease {
                    token: token.to_string(),
                    expires_at: Instant::now() + lease,
                },
            );
        }
    }
}

fn poisoned() -> CounterError {
    CounterError::Internal("memory store lock poisoned".to_string())
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut counters = self.counters.write().map_err(|_| poisoned())?;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let counters = self.counters.read().map_err(|_| poisoned())?;
        Ok(counters
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        let counters = self.counters.read().map_err(|_| poisoned())?;
        Ok(keys.iter().map(|key| counters.get(key).copied()).collect())
    }

    async fn delete_all(&self, keys: &[String]) -> Result<u64> {
        let mut counters = self.counters.write().map_err(|_| poisoned())?;
        Ok(keys.iter().filter(|key| counters.remove(*key).is_some()).count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl InstanceLock for MemoryStore {
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut locks = self.locks.write().map_err(|_| poisoned())?;
        let now = Instant::now();
        if locks.get(name).is_some_and(|held| held.expires_at > now) {
            return Ok(false);
        }
        locks.insert(
            name.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut locks = self.locks.write().map_err(|_| poisoned())?;
        match locks.get_mut(name) {
            Some(held) if held.token == token => {
                held.expires_at = Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.write().map_err(|_| poisoned())?;
        if locks.get(name).is_some_and(|held| held.token == token) {
            locks.remove(name);
            return Ok(true);
        }
        Ok(false)
    }
}
