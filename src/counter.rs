use crate::error::{CounterError, Result};
use crate::store::{bucket_prefix, hashtag_from_key, CounterStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One ranked hashtag as returned by `/count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub hashtag: String,
    pub count: i64,
}

struct CachedTop {
    computed_at: Instant,
    entries: Vec<RankEntry>,
}

/// Cached rankings plus a per-bucket generation bumped by every reset.
///
/// A ranking computed under an older generation is never stored.
#[derive(Default)]
struct ResultCache {
    entries: HashMap<(String, usize), CachedTop>,
    generations: HashMap<String, u64>,
}

impl ResultCache {
    fn generation(&self, bucket: &str) -> u64 {
        self.generations.get(bucket).copied().unwrap_or_default()
    }
}

/// Query side of the counters: top-N ranking and bucket reset.
///
/// Reads are weakly consistent. Keys are enumerated and then fetched in a
/// second round-trip, so a key reset in between is simply left out.
pub struct HashtagCounter {
    store: Arc<dyn CounterStore>,
    cache_ttl: Duration,
    cache: RwLock<ResultCache>,
}

impl HashtagCounter {
    pub fn new(store: Arc<dyn CounterStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache_ttl,
            cache: RwLock::new(ResultCache::default()),
        }
    }

    /// Top `n` hashtags of `bucket`, highest count first.
    pub async fn top(&self, bucket: &str, n: i64) -> Result<Vec<RankEntry>> {
        if n <= 0 {
            return Ok(Vec::new());
        }
        let n = usize::try_from(n).unwrap_or(usize::MAX);

        if self.cache_ttl.is_zero() {
            let mut entries = self.rank(bucket).await?;
            entries.truncate(n);
            return Ok(entries);
        }

        let cache_key = (bucket.to_string(), n);
        let generation = {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.entries.get(&cache_key) {
                if cached.computed_at.elapsed() < self.cache_ttl {
                    debug!(bucket = %bucket, n, "serving cached ranking");
                    return Ok(cached.entries.clone());
                }
            }
            cache.generation(bucket)
        };

        let mut entries = self.rank(bucket).await?;
        entries.truncate(n);

        let mut cache = self.cache.write().await;
        if cache.generation(bucket) != generation {
            debug!(bucket = %bucket, n, "bucket reset while ranking, not caching");
            return Ok(entries);
        }
        let ttl = self.cache_ttl;
        cache.entries.retain(|_, cached| cached.computed_at.elapsed() < ttl);
        cache.entries.insert(
            cache_key,
            CachedTop {
                computed_at: Instant::now(),
                entries: entries.clone(),
            },
        );

        Ok(entries)
    }

    /// Every hashtag of `bucket`, ranked, bypassing the cache.
    pub async fn rank(&self, bucket: &str) -> Result<Vec<RankEntry>> {
        let prefix = bucket_prefix(bucket);
        let keys = self.store.keys_with_prefix(&prefix).await?;
        let values = self.store.multi_get(&keys).await?;
        Ok(rank_entries(&prefix, &keys, &values))
    }

    /// Deletes every counter of `bucket`. Returns how many keys were removed.
    pub async fn reset(&self, bucket: &str) -> Result<u64> {
        if bucket.trim().is_empty() {
            return Err(CounterError::MissingFilter);
        }

        let keys = self.store.keys_with_prefix(&bucket_prefix(bucket)).await?;
        let deleted = self.store.delete_all(&keys).await?;

        let mut cache = self.cache.write().await;
        *cache.generations.entry(bucket.to_string()).or_default() += 1;
        cache.entries.retain(|(cached, _), _| cached != bucket);
        drop(cache);

        info!(bucket = %bucket, deleted, "reset bucket");
        Ok(deleted)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

/// Pairs enumerated keys with their fetched values and sorts by count.
///
/// Keys whose value vanished are dropped. Equal counts keep enumeration order.
pub fn rank_entries(prefix: &str, keys: &[String], values: &[Option<i64>]) -> Vec<RankEntry> {
    let mut entries: Vec<RankEntry> = keys
        .iter()
        .zip(values)
        .filter_map(|(key, value)| {
            let count = (*value)?;
            let hashtag = hashtag_from_key(prefix, key)?;
            Some(RankEntry {
                hashtag: hashtag.to_string(),
                count,
            })
        })
        .collect();

    entries.sort_by(|a, b| b.count.cmp(&a.count));
    entries
}
