use std::time::Duration;

use async_trait::async_trait;
use manager_sdk::registry::{RegistryError, RegistryLock, RegistryStore};
use redis::aio::ConnectionManager;

const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(25);
const SCAN_BATCH: usize = 200;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn store_err(err: redis::RedisError) -> RegistryError {
    RegistryError::Store(err.to_string())
}

/// Registry store on Redis. Locks are `SET NX PX` keys holding a random token
/// and released with a compare-and-delete script, so a lock whose TTL lapsed
/// cannot be released by its former holder.
#[derive(Clone)]
pub struct RedisRegistryStore {
    conn: ConnectionManager,
    lock_timeout: Duration,
}

impl RedisRegistryStore {
    pub async fn connect(url: &str, lock_timeout: Duration) -> Result<Self, RegistryError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self { conn, lock_timeout })
    }
}

struct RedisLock {
    conn: ConnectionManager,
    key: String,
    token: String,
    released: bool,
}

#[async_trait]
impl RegistryLock for RedisLock {
    async fn release(&mut self) -> Result<(), RegistryError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        redis::Script::new(UNLOCK_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<_, i64>(&mut self.conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys: Vec<String> = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        // Keys deleted between SCAN and MGET come back as nil.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn RegistryLock>, RegistryError> {
        let mut conn = self.conn.clone();
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(LOCK_TTL.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            if acquired.is_some() {
                return Ok(Box::new(RedisLock {
                    conn,
                    key: key.to_string(),
                    token,
                    released: false,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistryError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }
}
