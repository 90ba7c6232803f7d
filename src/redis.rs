use crate::error::{CounterError, Result};
use crate::lock::InstanceLock;
use crate::store::{escape_glob, CounterStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use std::collections::HashSet;
use std::time::Duration;

const SCAN_BATCH: usize = 1000;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed counter store and lock backend.
///
/// Uses a multiplexed connection manager that reconnects on its own, so one
/// failed command never poisons later ones.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CounterError::Redis(format!("Failed to create Redis client: {}", e)))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CounterError::Redis(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self { manager })
    }

    async fn eval_script<T>(&self, script: &str, keys: &[&str], args: &[String]) -> Result<T>
    where
        T: FromRedisValue,
    {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(arg);
        }

        cmd.query_async::<_, T>(&mut conn)
            .await
            .map_err(|e| CounterError::Redis(format!("Script execution failed: {}", e)))
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        redis::cmd("INCR")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| CounterError::Redis(format!("INCR failed: {}", e)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        // SCAN may return a key more than once
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| CounterError::Redis(format!("SCAN failed: {}", e)))?;

            for key in batch {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.manager.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async::<_, Vec<Option<i64>>>(&mut conn)
            .await
            .map_err(|e| CounterError::Redis(format!("MGET failed: {}", e)))
    }

    async fn delete_all(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(|e| CounterError::Redis(format!("DEL failed: {}", e)))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| CounterError::Redis(format!("Ping failed: {}", e)))
    }
}

#[async_trait]
impl InstanceLock for RedisStore {
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_millis(lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| CounterError::Redis(format!("SET NX failed: {}", e)))?;

        Ok(reply.is_some())
    }

    async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let renewed: i64 = self
            .eval_script(
                RENEW_SCRIPT,
                &[name],
                &[token.to_string(), lease_millis(lease).to_string()],
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let deleted: i64 = self
            .eval_script(RELEASE_SCRIPT, &[name], &[token.to_string()])
            .await?;
        Ok(deleted == 1)
    }
}

fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}
