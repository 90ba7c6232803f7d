//! Counter store access contract.
//!
//! Counters live in a flat key-space as `<bucket>:<hashtag>` with integer
//! values. The ingester only increments; the query service enumerates,
//! fetches and deletes. Nothing here is transactional across calls.

use crate::error::Result;
use async_trait::async_trait;

/// Operations the ingester and query service need from the backing store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Lists every key starting with the literal `prefix`. Order is unspecified.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetches values aligned by position with `keys`. Missing keys are `None`.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;

    /// Deletes `keys` and returns how many existed.
    async fn delete_all(&self, keys: &[String]) -> Result<u64>;

    /// Round-trips to the store.
    async fn ping(&self) -> Result<()>;
}

pub fn bucket_prefix(bucket: &str) -> String {
    format!("{}:", bucket)
}

pub fn counter_key(bucket: &str, hashtag: &str) -> String {
    format!("{}:{}", bucket, hashtag)
}

/// Recovers the hashtag from a key enumerated under `prefix`.
pub fn hashtag_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|tag| !tag.is_empty())
}

/// Escapes glob metacharacters so a bucket name matches literally in `SCAN MATCH`.
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
