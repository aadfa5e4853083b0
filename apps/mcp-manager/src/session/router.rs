//! Per-manager session map. Resolves ids to local or remote sessions and
//! takes sessions over when their owner disappears.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use manager_sdk::protocol::{CreateSessionRequest, SessionSpec};
use manager_sdk::registry::StoredSession;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{validate_client, validate_config};
use super::managers::ManagerClients;
use super::{LocalSession, RemoteSession, Session, SessionContext, StopReason};
use crate::audit::now_ms;
use crate::error::{codes, ErrorKind, ManagerError, ManagerResult};
use crate::log_throttle::{should_log_routine_failure, RoutineLogKind};
use crate::metrics::{ROUTINE_FAILURES, SESSIONS_RESOLVED, SESSION_TAKEOVERS};
use crate::registry::{Reassignment, Refresh, Registry};

const MAX_CONCURRENT_PINGS: usize = 100;

/// Async mutex per key. Entries vanish once nobody holds or awaits them.
#[derive(Default)]
struct KeyLock {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLock {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            match locks.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, lock| lock.strong_count() > 0);
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

pub struct Sessions {
    ctx: Arc<SessionContext>,
    registry: Registry,
    peers: ManagerClients,
    sessions: RwLock<HashMap<String, Session>>,
    keylock: KeyLock,
    shutdown: CancellationToken,
}

impl Sessions {
    pub fn new(ctx: Arc<SessionContext>, registry: Registry, peers: ManagerClients) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            peers,
            sessions: RwLock::new(HashMap::new()),
            keylock: KeyLock::default(),
            shutdown: CancellationToken::new(),
        })
    }

    fn manager_id(&self) -> &str {
        &self.ctx.manager_id
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn cached(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    fn insert(&self, session: Session) {
        SESSIONS_RESOLVED
            .with_label_values(&[session.placement()])
            .inc();
        self.sessions
            .write()
            .insert(session.id().to_string(), session);
    }

    /// Removes `session` from the map unless it was already replaced.
    fn remove_if_same(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session.id()) {
            Some(current) if current.is_same(session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    fn build_local(&self, stored: StoredSession) -> ManagerResult<Session> {
        let spec = stored.spec.clone().ok_or_else(|| {
            ManagerError::internal("registry row carries no session spec")
                .with_detail("session_id", stored.id.as_str())
        })?;
        Ok(Session::Local(LocalSession::new(
            stored,
            spec,
            Arc::clone(&self.ctx),
        )))
    }

    async fn build_remote(&self, stored: StoredSession) -> ManagerResult<Session> {
        let client = self.peers.get(&stored.manager_id).await?;
        Ok(Session::Remote(RemoteSession::new(
            stored,
            client,
            self.ctx.timing.remote_discard_after,
        )))
    }

    /// Wraps a registry row. Rows whose owner has no manager row left are
    /// taken over on the spot.
    async fn build(&self, stored: StoredSession) -> ManagerResult<Session> {
        if stored.manager_id == self.manager_id() {
            return self.build_local(stored);
        }
        match self.build_remote(stored.clone()).await {
            Err(err) if err.has_code(codes::OWNER_UNREACHABLE) => self.take_over(&stored).await,
            other => other,
        }
    }

    pub async fn upsert_session(&self, request: CreateSessionRequest) -> ManagerResult<Session> {
        if request.session_id.trim().is_empty() {
            return Err(ManagerError::invalid_request("session_id is required"));
        }
        validate_config(&request.config)?;
        validate_client(&request.mcp_client)?;

        let id = request.session_id;
        let _guard = self.keylock.lock(&id).await;
        let now = now_ms();
        let candidate = StoredSession {
            id: id.clone(),
            manager_id: self.manager_id().to_string(),
            session_uuid: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            last_ping_at: now,
            spec: Some(SessionSpec {
                config: request.config,
                mcp_client: request.mcp_client,
            }),
        };
        let (stored, created) = self.registry.upsert_session(candidate).await?;
        if let Some(existing) = self.cached(&id) {
            if existing.stored().same_generation(&stored) {
                return Ok(existing);
            }
        }
        let session = self.build(stored).await?;
        if let Session::Local(local) = &session {
            if let Err(err) = local.prepare_run_config().await {
                local.stop(StopReason::Error).await;
                return Err(err);
            }
        }
        self.insert(session.clone());
        info!(
            session_id = %id,
            owner = %session.stored().manager_id,
            placement = session.placement(),
            created,
            "session resolved"
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> ManagerResult<Session> {
        if let Some(session) = self.cached(id) {
            return Ok(session);
        }
        let _guard = self.keylock.lock(id).await;
        if let Some(session) = self.cached(id) {
            return Ok(session);
        }
        let stored = self
            .registry
            .get_session(id)
            .await?
            .ok_or_else(|| ManagerError::session_not_found(id))?;
        let session = self.build(stored).await?;
        self.insert(session.clone());
        debug!(session_id = %id, placement = session.placement(), "session loaded from registry");
        Ok(session)
    }

    /// Runs `op` against the session, retrying once on a new owner when the
    /// current owner cannot serve it.
    pub async fn with_session<F, Fut, T>(&self, id: &str, op: F) -> ManagerResult<T>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = ManagerResult<T>>,
    {
        let session = self.get_session(id).await?;
        match op(session.clone()).await {
            Err(err) if owner_failed(&session, &err) => {
                warn!(
                    session_id = %id,
                    owner = %session.stored().manager_id,
                    error = %err.chain(),
                    "owning manager failed; recovering session"
                );
                let recovered = self.recover(&session).await?;
                op(recovered).await
            }
            other => other,
        }
    }

    /// Re-resolves `stale` under the key lock, taking it over when the
    /// registry still names the owner that failed.
    async fn recover(&self, stale: &Session) -> ManagerResult<Session> {
        let id = stale.id().to_string();
        let _guard = self.keylock.lock(&id).await;
        if let Some(current) = self.cached(&id) {
            if !current.is_same(stale) {
                return Ok(current);
            }
        }
        self.remove_if_same(stale);
        let Some(current) = self.registry.get_session(&id).await? else {
            return Err(ManagerError::session_not_found(&id));
        };
        let session = if current.same_generation(stale.stored()) {
            self.take_over(&current).await?
        } else {
            self.build(current).await?
        };
        self.insert(session.clone());
        Ok(session)
    }

    /// Moves the row to this manager. A concurrent takeover wins and is
    /// followed instead.
    pub async fn take_over(&self, expected: &StoredSession) -> ManagerResult<Session> {
        let uuid = uuid::Uuid::now_v7().to_string();
        match self
            .registry
            .reassign_session(expected, self.manager_id(), &uuid)
            .await?
        {
            Reassignment::Reassigned(stored) => {
                SESSION_TAKEOVERS.with_label_values(&["taken"]).inc();
                info!(
                    session_id = %stored.id,
                    previous_owner = %expected.manager_id,
                    session_uuid = %stored.session_uuid,
                    "took over session"
                );
                self.peers.forget(&expected.manager_id);
                self.build_local(stored)
            }
            Reassignment::Stale(current) => {
                SESSION_TAKEOVERS.with_label_values(&["stale"]).inc();
                debug!(session_id = %current.id, owner = %current.manager_id, "takeover lost to a newer owner");
                if current.manager_id == self.manager_id() {
                    self.build_local(current)
                } else {
                    self.build_remote(current).await
                }
            }
            Reassignment::Missing => {
                SESSION_TAKEOVERS.with_label_values(&["missing"]).inc();
                Err(ManagerError::session_not_found(&expected.id))
            }
        }
    }

    pub async fn discard_session(&self, id: &str) -> ManagerResult<()> {
        self.with_session(id, |session| async move {
            match &session {
                Session::Local(local) => {
                    self.remove_if_same(&session);
                    self.registry
                        .delete_session(local.id(), Some(local.stored()))
                        .await?;
                    local.stop(StopReason::Closed).await;
                }
                Session::Remote(remote) => {
                    remote.discard().await?;
                    self.remove_if_same(&session);
                }
            }
            info!(session_id = %session.id(), placement = session.placement(), "session discarded");
            Ok(())
        })
        .await
    }

    /// Drops idle sessions. Local ones also lose their registry row.
    pub async fn discard_idle(&self) -> usize {
        let mut discarded = 0;
        for session in self.list() {
            if !session.can_discard().await {
                continue;
            }
            if !self.remove_if_same(&session) {
                continue;
            }
            if let Session::Local(local) = &session {
                if let Err(err) = self
                    .registry
                    .delete_session(local.id(), Some(local.stored()))
                    .await
                {
                    warn!(session_id = %local.id(), error = %err, "failed to delete idle session row");
                }
                local.stop(StopReason::Expired).await;
            }
            debug!(session_id = %session.id(), placement = session.placement(), "discarded idle session");
            discarded += 1;
        }
        discarded
    }

    /// Refreshes the registry rows of local sessions. Sessions whose row
    /// moved or vanished are dropped here without touching the row.
    pub async fn ping_sessions(&self) {
        let locals: Vec<Arc<LocalSession>> = self
            .list()
            .into_iter()
            .filter_map(|session| match session {
                Session::Local(local) => Some(local),
                Session::Remote(_) => None,
            })
            .collect();

        futures::stream::iter(locals)
            .for_each_concurrent(MAX_CONCURRENT_PINGS, |local| async move {
                let reason = match self.registry.refresh_session(local.stored()).await {
                    Ok(Refresh::Refreshed(_)) => return,
                    Ok(Refresh::Moved(current)) => {
                        info!(session_id = %local.id(), owner = %current.manager_id, "session moved to another manager");
                        StopReason::Moved
                    }
                    Ok(Refresh::Missing) => {
                        info!(session_id = %local.id(), "session row vanished");
                        StopReason::Closed
                    }
                    Err(err) => {
                        ROUTINE_FAILURES.with_label_values(&["session_ping"]).inc();
                        if should_log_routine_failure(RoutineLogKind::SessionPing, local.id()) {
                            warn!(session_id = %local.id(), error = %err, "session ping failed");
                        }
                        return;
                    }
                };
                self.remove_if_same(&Session::Local(Arc::clone(&local)));
                local.stop(reason).await;
            })
            .await;
    }

    pub fn dump_state(&self) {
        let sessions = self.list();
        let local = sessions
            .iter()
            .filter(|s| matches!(s, Session::Local(_)))
            .count();
        let ids: Vec<&str> = sessions.iter().map(Session::id).collect();
        debug!(
            manager_id = %self.manager_id(),
            sessions = sessions.len(),
            local,
            remote = sessions.len() - local,
            ids = ?ids,
            workers = ?self.ctx.pool.snapshots(),
            "session state"
        );
    }

    /// Starts the discard, ping and state-dump loops. They run until
    /// [`Sessions::stop`].
    pub fn spawn_routines(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let timing = self.ctx.timing;
        vec![
            self.spawn_every(timing.discard_sweep, |sessions| async move {
                sessions.discard_idle().await;
            }),
            self.spawn_every(timing.session_ping, |sessions| async move {
                sessions.ping_sessions().await;
            }),
            self.spawn_every(timing.state_dump, |sessions| async move {
                sessions.dump_state();
            }),
        ]
    }

    fn spawn_every<F, Fut>(self: &Arc<Self>, period: std::time::Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Sessions>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let sessions = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => tick(Arc::clone(&sessions)).await,
                }
            }
        })
    }

    /// Stops the routines and every session, deleting the rows this manager
    /// still owns.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let sessions: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Session::Local(local) = session {
                if let Err(err) = self
                    .registry
                    .delete_session(local.id(), Some(local.stored()))
                    .await
                {
                    warn!(session_id = %local.id(), error = %err, "failed to delete session row on shutdown");
                }
                local.stop(StopReason::Closed).await;
            }
        }
        info!(manager_id = %self.manager_id(), "sessions stopped");
    }
}

fn owner_failed(session: &Session, err: &ManagerError) -> bool {
    matches!(session, Session::Remote(_))
        && (err.has_code(codes::OWNER_UNREACHABLE) || err.kind() == ErrorKind::NotFound)
}
