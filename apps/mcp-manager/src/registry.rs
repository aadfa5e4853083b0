//! Distributed session registry: manager rows, session ownership rows and the
//! per-session lock that serialises every ownership change.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use manager_sdk::registry::{
    manager_key, session_key, session_lock_key, ManagerRecord, RegistryError, RegistryStore,
    StoredSession, MANAGERS_PREFIX, SESSIONS_PREFIX,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::now_ms;
use crate::log_throttle::{should_log_routine_failure, RoutineLogKind};
use crate::metrics::ROUTINE_FAILURES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryTiming {
    pub ping_interval: Duration,
    pub cleanup_interval: Duration,
    pub manager_dead_after: Duration,
    pub session_dead_after: Duration,
}

impl Default for RegistryTiming {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(10),
            manager_dead_after: Duration::from_secs(15),
            session_dead_after: Duration::from_secs(60),
        }
    }
}

/// Outcome of the owner's periodic session ping.
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh {
    Refreshed(StoredSession),
    /// Another generation owns the row now.
    Moved(StoredSession),
    Missing,
}

/// Outcome of a takeover attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reassignment {
    Reassigned(StoredSession),
    /// The row changed since the caller read it; carries the current row.
    Stale(StoredSession),
    Missing,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub managers_removed: usize,
    pub sessions_removed: usize,
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RegistryStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn RegistryStore> {
        Arc::clone(&self.store)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RegistryError> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| RegistryError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        let raw = serde_json::to_string(value).map_err(RegistryError::Encode)?;
        self.store.put(key, raw).await
    }

    async fn list_decoded<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, RegistryError> {
        let mut out = Vec::new();
        for (key, raw) in self.store.list(prefix).await? {
            match serde_json::from_str(&raw) {
                Ok(value) => out.push(value),
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable registry row"),
            }
        }
        Ok(out)
    }

    /// Runs `f` while holding the session's distributed lock. The lock is
    /// released on every path, including when `f` fails.
    async fn with_session_lock<T, F, Fut>(&self, id: &str, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut lock = self.store.lock(&session_lock_key(id)).await?;
        let result = f().await;
        if let Err(err) = lock.release().await {
            warn!(session_id = %id, error = %err, "failed to release session lock");
        }
        result
    }

    pub async fn create_manager(&self, record: &ManagerRecord) -> Result<(), RegistryError> {
        self.write(&manager_key(&record.id), record).await
    }

    pub async fn get_manager(&self, id: &str) -> Result<Option<ManagerRecord>, RegistryError> {
        self.read(&manager_key(id)).await
    }

    pub async fn list_managers(&self) -> Result<Vec<ManagerRecord>, RegistryError> {
        self.list_decoded(MANAGERS_PREFIX).await
    }

    pub async fn update_manager(&self, record: &ManagerRecord) -> Result<(), RegistryError> {
        self.write(&manager_key(&record.id), record).await
    }

    pub async fn delete_manager(&self, id: &str) -> Result<bool, RegistryError> {
        self.store.delete(&manager_key(id)).await
    }

    /// Refreshes `last_ping_at`, recreating the row if the sweep removed it.
    pub async fn ping_manager(&self, record: &ManagerRecord) -> Result<ManagerRecord, RegistryError> {
        let mut current = self.get_manager(&record.id).await?.unwrap_or_else(|| record.clone());
        current.last_ping_at = now_ms();
        self.update_manager(&current).await?;
        Ok(current)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<StoredSession>, RegistryError> {
        self.read(&session_key(id)).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<StoredSession>, RegistryError> {
        self.list_decoded(SESSIONS_PREFIX).await
    }

    pub async fn list_sessions_by_manager(
        &self,
        manager_id: &str,
    ) -> Result<Vec<StoredSession>, RegistryError> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.manager_id == manager_id)
            .collect())
    }

    /// Unlocked write used by tests and tooling; ownership changes go through
    /// the locked operations below.
    pub async fn update_session(&self, session: &StoredSession) -> Result<(), RegistryError> {
        self.write(&session_key(&session.id), session).await
    }

    /// Creates the row unless one exists. Returns the authoritative row and
    /// whether this call created it.
    pub async fn upsert_session(
        &self,
        candidate: StoredSession,
    ) -> Result<(StoredSession, bool), RegistryError> {
        let id = candidate.id.clone();
        self.with_session_lock(&id, || async {
            if let Some(existing) = self.get_session(&id).await? {
                return Ok((existing, false));
            }
            self.update_session(&candidate).await?;
            Ok((candidate, true))
        })
        .await
    }

    /// Deletes the row. With `expected`, only that generation is deleted.
    pub async fn delete_session(
        &self,
        id: &str,
        expected: Option<&StoredSession>,
    ) -> Result<bool, RegistryError> {
        self.with_session_lock(id, || async {
            let Some(current) = self.get_session(id).await? else {
                return Ok(false);
            };
            if let Some(expected) = expected {
                if !current.same_generation(expected) {
                    return Ok(false);
                }
            }
            self.store.delete(&session_key(id)).await
        })
        .await
    }

    /// Moves the session to `new_manager_id` if the row still holds the
    /// generation the caller observed.
    pub async fn reassign_session(
        &self,
        expected: &StoredSession,
        new_manager_id: &str,
        new_uuid: &str,
    ) -> Result<Reassignment, RegistryError> {
        self.with_session_lock(&expected.id, || async {
            let Some(current) = self.get_session(&expected.id).await? else {
                return Ok(Reassignment::Missing);
            };
            if !current.same_generation(expected) {
                return Ok(Reassignment::Stale(current));
            }
            let now = now_ms();
            let moved = StoredSession {
                manager_id: new_manager_id.to_string(),
                session_uuid: new_uuid.to_string(),
                last_ping_at: now,
                ..current
            };
            self.update_session(&moved).await?;
            Ok(Reassignment::Reassigned(moved))
        })
        .await
    }

    pub async fn refresh_session(&self, session: &StoredSession) -> Result<Refresh, RegistryError> {
        self.with_session_lock(&session.id, || async {
            let Some(mut current) = self.get_session(&session.id).await? else {
                return Ok(Refresh::Missing);
            };
            if !current.same_generation(session) {
                return Ok(Refresh::Moved(current));
            }
            current.last_ping_at = now_ms();
            self.update_session(&current).await?;
            Ok(Refresh::Refreshed(current))
        })
        .await
    }

    /// Removes managers and sessions whose last ping is older than the
    /// configured thresholds. Sessions are not removed with their manager.
    pub async fn cleanup(&self, timing: &RegistryTiming) -> Result<CleanupReport, RegistryError> {
        let now = now_ms();
        let mut report = CleanupReport::default();

        for manager in self.list_managers().await? {
            if now - manager.last_ping_at > timing.manager_dead_after.as_millis() as i64
                && self.delete_manager(&manager.id).await?
            {
                info!(manager_id = %manager.id, "removed dead manager");
                report.managers_removed += 1;
            }
        }

        let dead_after = timing.session_dead_after.as_millis() as i64;
        for session in self.list_sessions().await? {
            if now - session.last_ping_at <= dead_after {
                continue;
            }
            let removed = self
                .with_session_lock(&session.id, || async {
                    match self.get_session(&session.id).await? {
                        Some(current) if now_ms() - current.last_ping_at > dead_after => {
                            self.store.delete(&session_key(&session.id)).await
                        }
                        _ => Ok(false),
                    }
                })
                .await?;
            if removed {
                info!(session_id = %session.id, manager_id = %session.manager_id, "removed dead session");
                report.sessions_removed += 1;
            }
        }
        Ok(report)
    }
}

/// Keeps this manager's row alive until `shutdown` fires.
pub fn spawn_manager_ping(
    registry: Registry,
    record: ManagerRecord,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = registry.ping_manager(&record).await {
                ROUTINE_FAILURES.with_label_values(&["manager_ping"]).inc();
                if should_log_routine_failure(RoutineLogKind::ManagerPing, &record.id) {
                    warn!(manager_id = %record.id, error = %err, "manager ping failed");
                }
            }
        }
        debug!(manager_id = %record.id, "manager ping stopped");
    })
}

pub fn spawn_registry_cleanup(
    registry: Registry,
    manager_id: String,
    timing: RegistryTiming,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(timing.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match registry.cleanup(&timing).await {
                Ok(report) if report != CleanupReport::default() => {
                    debug!(
                        manager_id = %manager_id,
                        managers_removed = report.managers_removed,
                        sessions_removed = report.sessions_removed,
                        "registry cleanup"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    ROUTINE_FAILURES.with_label_values(&["registry_cleanup"]).inc();
                    if should_log_routine_failure(RoutineLogKind::RegistryCleanup, &manager_id) {
                        warn!(manager_id = %manager_id, error = %err, "registry cleanup failed");
                    }
                }
            }
        }
    })
}
