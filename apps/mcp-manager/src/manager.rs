//! Composition root of one manager process: registry, audit log, worker pool
//! and session router, plus the background routines that keep them alive.

use std::sync::Arc;
use std::time::Duration;

use manager_sdk::protocol::{
    ListManagersResponse, ManagerInfoResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    WorkerType,
};
use manager_sdk::registry::{InMemoryRegistryStore, ManagerRecord, RegistryStore};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{now_ms, AuditLog, AuditStore, InMemoryAuditStore};
use crate::audit_redis::RedisAuditStore;
use crate::config::{AppConfig, StandaloneWorker};
use crate::error::{ManagerError, ManagerResult};
use crate::registry::{spawn_manager_ping, spawn_registry_cleanup, Registry, RegistryTiming};
use crate::registry_redis::RedisRegistryStore;
use crate::session::managers::ManagerClients;
use crate::session::{SessionContext, SessionTiming, Sessions};
use crate::workers::remote::{LostHook, RemoteWorkerFactory};
use crate::workers::{Launcher, Worker, WorkerFactory, WorkerPool};

const DEFAULT_CONNECTION_INACTIVITY: Duration = Duration::from_secs(5 * 60);

pub struct ManagerBuilder {
    manager_id: String,
    manager_address: String,
    worker_broker_address: Option<String>,
    registry_store: Option<Arc<dyn RegistryStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    worker_factory: Option<Arc<dyn WorkerFactory>>,
    registry_timing: RegistryTiming,
    session_timing: SessionTiming,
    standalone_workers: Vec<StandaloneWorker>,
}

impl ManagerBuilder {
    pub fn worker_broker_address(mut self, address: impl Into<String>) -> Self {
        self.worker_broker_address = Some(address.into());
        self
    }

    pub fn registry_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.registry_store = Some(store);
        self
    }

    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    pub fn worker_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.worker_factory = Some(factory);
        self
    }

    pub fn registry_timing(mut self, timing: RegistryTiming) -> Self {
        self.registry_timing = timing;
        self
    }

    pub fn session_timing(mut self, timing: SessionTiming) -> Self {
        self.session_timing = timing;
        self
    }

    pub fn standalone_workers(mut self, workers: Vec<StandaloneWorker>) -> Self {
        self.standalone_workers = workers;
        self
    }

    pub fn build(self) -> Arc<Manager> {
        let registry = Registry::new(
            self.registry_store
                .unwrap_or_else(|| InMemoryRegistryStore::new() as Arc<dyn RegistryStore>),
        );
        let audit = AuditLog::new(
            self.audit_store
                .unwrap_or_else(|| InMemoryAuditStore::new() as Arc<dyn AuditStore>),
        );
        let factory = self.worker_factory.unwrap_or_else(|| {
            Arc::new(RemoteWorkerFactory::new(DEFAULT_CONNECTION_INACTIVITY))
        });
        let pool = WorkerPool::new();
        let ctx = Arc::new(SessionContext {
            manager_id: self.manager_id.clone(),
            pool: Arc::clone(&pool),
            launcher: Launcher::new(Arc::clone(&pool)),
            audit: audit.clone(),
            timing: self.session_timing,
        });
        let peers = ManagerClients::new(registry.clone(), reqwest::Client::new());
        let sessions = Sessions::new(ctx, registry.clone(), peers);
        let now = now_ms();
        let record = ManagerRecord {
            id: self.manager_id,
            worker_broker_address: self
                .worker_broker_address
                .unwrap_or_else(|| self.manager_address.clone()),
            manager_address: self.manager_address,
            joined_at: now,
            last_ping_at: now,
        };

        Arc::new(Manager {
            record,
            registry,
            registry_timing: self.registry_timing,
            audit,
            pool,
            factory,
            sessions,
            standalone_workers: self.standalone_workers,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct Manager {
    record: ManagerRecord,
    registry: Registry,
    registry_timing: RegistryTiming,
    audit: AuditLog,
    pool: Arc<WorkerPool>,
    factory: Arc<dyn WorkerFactory>,
    sessions: Arc<Sessions>,
    standalone_workers: Vec<StandaloneWorker>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn builder(
        manager_id: impl Into<String>,
        manager_address: impl Into<String>,
    ) -> ManagerBuilder {
        ManagerBuilder {
            manager_id: manager_id.into(),
            manager_address: manager_address.into(),
            worker_broker_address: None,
            registry_store: None,
            audit_store: None,
            worker_factory: None,
            registry_timing: RegistryTiming::default(),
            session_timing: SessionTiming::default(),
            standalone_workers: Vec::new(),
        }
    }

    /// Builds a manager from process configuration. With `redis_url` set the
    /// registry and audit log live in Redis; otherwise both stay in memory.
    pub async fn from_config(cfg: &AppConfig) -> ManagerResult<Arc<Self>> {
        let mut builder = Self::builder(cfg.manager_id.clone(), cfg.manager_address.clone())
            .worker_broker_address(cfg.worker_broker_address.clone())
            .worker_factory(Arc::new(RemoteWorkerFactory::new(cfg.connection_inactivity)))
            .registry_timing(cfg.registry)
            .session_timing(cfg.session)
            .standalone_workers(cfg.standalone_workers.clone());

        match &cfg.redis_url {
            Some(url) => {
                let registry = RedisRegistryStore::connect(url, cfg.lock_timeout).await?;
                let audit = RedisAuditStore::connect(url).await?;
                info!(redis_url = %url, "using redis registry and audit store");
                builder = builder
                    .registry_store(Arc::new(registry))
                    .audit_store(Arc::new(audit));
            }
            None => {
                warn!("MCP_MANAGER__REDIS_URL not set; registry and audit log are in-memory and not shared");
                builder = builder.registry_store(InMemoryRegistryStore::with_lock_timeout(
                    cfg.lock_timeout,
                ));
            }
        }
        Ok(builder.build())
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &ManagerRecord {
        &self.record
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }

    fn lost_hook(&self) -> LostHook {
        let pool = Arc::downgrade(&self.pool);
        Arc::new(move |worker_id: &str| {
            if let Some(pool) = pool.upgrade() {
                pool.self_unregister_worker(worker_id);
            }
        })
    }

    fn build_worker(
        &self,
        worker_id: &str,
        worker_type: WorkerType,
        address: &str,
        standalone: bool,
    ) -> Arc<dyn Worker> {
        self.factory
            .build(worker_id, worker_type, address, standalone, self.lost_hook())
    }

    /// Adds the worker to the pool. Registering a known id is a no-op.
    pub async fn register_worker(
        &self,
        request: RegisterWorkerRequest,
    ) -> ManagerResult<RegisterWorkerResponse> {
        if request.worker_id.trim().is_empty() {
            return Err(ManagerError::invalid_request("worker_id is required"));
        }
        if request.address.trim().is_empty() {
            return Err(ManagerError::invalid_request("address is required"));
        }
        if self.pool.get_worker(&request.worker_id).is_some() {
            return Ok(RegisterWorkerResponse {
                worker_id: request.worker_id,
                registered: false,
            });
        }
        let worker = self.build_worker(
            &request.worker_id,
            request.worker_type,
            &request.address,
            false,
        );
        let registered = self.pool.register_worker(worker).await.map_err(|err| {
            ManagerError::from(err).with_detail("worker_id", request.worker_id.as_str())
        })?;
        Ok(RegisterWorkerResponse {
            worker_id: request.worker_id,
            registered,
        })
    }

    /// Publishes this manager, registers standalone workers and starts the
    /// background routines.
    pub async fn start(&self) -> ManagerResult<()> {
        self.registry.create_manager(&self.record).await?;
        info!(
            manager_id = %self.id(),
            address = %self.record.manager_address,
            "manager registered"
        );

        for (index, standalone) in self.standalone_workers.iter().enumerate() {
            let worker_id = format!("standalone-{}-{index}", standalone.worker_type);
            let worker =
                self.build_worker(&worker_id, standalone.worker_type, &standalone.address, true);
            if let Err(err) = self.pool.register_worker(worker).await {
                warn!(
                    worker_id = %worker_id,
                    address = %standalone.address,
                    error = %err,
                    "failed to start standalone worker"
                );
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_manager_ping(
            self.registry.clone(),
            self.record.clone(),
            self.registry_timing.ping_interval,
            self.shutdown.clone(),
        ));
        tasks.push(spawn_registry_cleanup(
            self.registry.clone(),
            self.id().to_string(),
            self.registry_timing,
            self.shutdown.clone(),
        ));
        tasks.extend(self.sessions.spawn_routines());
        Ok(())
    }

    /// Stops routines, sessions and workers, then removes the manager row.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sessions.stop().await;
        self.pool.stop_all().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(err) = self.registry.delete_manager(self.id()).await {
            warn!(manager_id = %self.id(), error = %err, "failed to delete manager row");
        }
        info!(manager_id = %self.id(), "manager stopped");
    }

    pub async fn list_managers(&self) -> ManagerResult<ListManagersResponse> {
        Ok(ListManagersResponse {
            managers: self.registry.list_managers().await?,
        })
    }

    pub async fn info(&self) -> ManagerResult<ManagerInfoResponse> {
        let manager = self
            .registry
            .get_manager(self.id())
            .await?
            .unwrap_or_else(|| self.record.clone());
        Ok(ManagerInfoResponse {
            manager,
            session_count: self.sessions.len(),
            worker_count: self.pool.worker_count(),
        })
    }
}
