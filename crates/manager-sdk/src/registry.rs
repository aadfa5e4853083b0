use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::protocol::SessionSpec;

pub const MANAGERS_PREFIX: &str = "/managers/";
pub const SESSIONS_PREFIX: &str = "/sessions/";
pub const SESSION_LOCKS_PREFIX: &str = "/locks/sessions/";

pub fn manager_key(id: &str) -> String {
    format!("{MANAGERS_PREFIX}{id}")
}

pub fn session_key(id: &str) -> String {
    format!("{SESSIONS_PREFIX}{id}")
}

pub fn session_lock_key(id: &str) -> String {
    format!("{SESSION_LOCKS_PREFIX}{id}")
}

/// Registry row for a live manager process. Timestamps are unix millis.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManagerRecord {
    pub id: String,
    pub manager_address: String,
    pub worker_broker_address: String,
    pub joined_at: i64,
    pub last_ping_at: i64,
}

/// Registry row naming the manager that currently owns a session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub manager_id: String,
    pub session_uuid: String,
    pub created_at: i64,
    pub last_ping_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<SessionSpec>,
}

impl StoredSession {
    /// True when both rows describe the same ownership generation.
    pub fn same_generation(&self, other: &StoredSession) -> bool {
        self.id == other.id
            && self.manager_id == other.manager_id
            && self.session_uuid == other.session_uuid
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(String),
    #[error("timed out acquiring lock `{0}`")]
    LockTimeout(String),
    #[error("invalid record at `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A held distributed lock. Callers must release it on every path.
#[async_trait]
pub trait RegistryLock: Send {
    async fn release(&mut self) -> Result<(), RegistryError>;
}

/// Key/value coordination store backing the session registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError>;

    async fn put(&self, key: &str, value: String) -> Result<(), RegistryError>;

    /// Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, RegistryError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError>;

    async fn lock(&self, key: &str) -> Result<Box<dyn RegistryLock>, RegistryError>;
}

/// In-memory store for tests and single-node runs. Share one instance between
/// several managers to simulate a cluster.
pub struct InMemoryRegistryStore {
    values: Mutex<BTreeMap<String, String>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    lock_timeout: Duration,
    unavailable: AtomicBool,
}

impl Default for InMemoryRegistryStore {
    fn default() -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout: Duration::from_secs(10),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl InMemoryRegistryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            lock_timeout,
            ..Self::default()
        })
    }

    /// Makes every call fail with a store error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Store("registry unavailable".into()));
        }
        Ok(())
    }
}

struct InMemoryLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

#[async_trait]
impl RegistryLock for InMemoryLock {
    async fn release(&mut self) -> Result<(), RegistryError> {
        let mut table = self.table.lock().await;
        self.guard.take();
        // Nobody else holds or waits on the mutex once only the table owns it.
        if table
            .get(&self.key)
            .map(|entry| Arc::strong_count(entry) == 1)
            .unwrap_or(false)
        {
            table.remove(&self.key);
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        self.check_available()?;
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), RegistryError> {
        self.check_available()?;
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        self.check_available()?;
        Ok(self.values.lock().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        self.check_available()?;
        Ok(self
            .values
            .lock()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn RegistryLock>, RegistryError> {
        self.check_available()?;
        let mutex = {
            let mut table = self.locks.lock().await;
            Arc::clone(
                table
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = tokio::time::timeout(self.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| RegistryError::LockTimeout(key.to_string()))?;
        Ok(Box::new(InMemoryLock {
            key: key.to_string(),
            guard: Some(guard),
            table: Arc::clone(&self.locks),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_only_matching_prefix() {
        let store = InMemoryRegistryStore::new();
        store.put(&session_key("a"), "1".into()).await.unwrap();
        store.put(&session_key("b"), "2".into()).await.unwrap();
        store.put(&manager_key("m"), "3".into()).await.unwrap();

        let sessions = store.list(SESSIONS_PREFIX).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|(k, _)| k.starts_with(SESSIONS_PREFIX)));
        assert!(store.delete(&session_key("a")).await.unwrap());
        assert!(!store.delete(&session_key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryRegistryStore::with_lock_timeout(Duration::from_millis(50));
        let mut held = store.lock(&session_lock_key("s1")).await.unwrap();

        let err = store.lock(&session_lock_key("s1")).await.err().unwrap();
        assert!(matches!(err, RegistryError::LockTimeout(_)));

        held.release().await.unwrap();
        let mut again = store.lock(&session_lock_key("s1")).await.unwrap();
        again.release().await.unwrap();
        assert!(store.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_calls() {
        let store = InMemoryRegistryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("/sessions/x").await,
            Err(RegistryError::Store(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("/sessions/x").await.unwrap().is_none());
    }

    #[test]
    fn generation_compares_owner_and_uuid() {
        let a = StoredSession {
            id: "s1".into(),
            manager_id: "m1".into(),
            session_uuid: "u1".into(),
            created_at: 0,
            last_ping_at: 0,
            spec: None,
        };
        let mut b = a.clone();
        b.last_ping_at = 10;
        assert!(a.same_generation(&b));
        b.session_uuid = "u2".into();
        assert!(!a.same_generation(&b));
    }
}
