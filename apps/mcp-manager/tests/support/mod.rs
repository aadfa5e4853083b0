//! In-process workers and manager helpers shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use manager_sdk::protocol::{
    ContainerRunConfig, CreateSessionRequest, ImplementationInfo, McpErrorCode, McpErrorFrame,
    McpParticipant, ParticipantKind, SessionConfigSpec, SessionFrame, WorkerType,
};
use manager_sdk::registry::RegistryStore;
use manager_sdk::{ClientError, FrameStream};
use mcp_manager::manager::Manager;
use mcp_manager::mcp::McpMessage;
use mcp_manager::registry::RegistryTiming;
use mcp_manager::routes::build_router;
use mcp_manager::session::SessionTiming;
use mcp_manager::state::AppState;
use mcp_manager::workers::handshake;
use mcp_manager::workers::remote::LostHook;
use mcp_manager::workers::{
    ConnectionChannels, LauncherRequest, RunConfig, Worker, WorkerConnection,
    WorkerConnectionInput, WorkerError, WorkerFactory,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn client_participant() -> McpParticipant {
    McpParticipant {
        kind: ParticipantKind::Client,
        info: ImplementationInfo {
            name: "test-client".into(),
            version: "1.0.0".into(),
        },
        capabilities: json!({}),
        protocol_version: "2024-11-05".into(),
        instructions: None,
    }
}

pub fn container_session(session_id: &str, image: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: session_id.into(),
        config: SessionConfigSpec::container(ContainerRunConfig {
            image: image.into(),
            ..Default::default()
        }),
        mcp_client: client_participant(),
    }
}

pub fn initialize_raw(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        }
    })
    .to_string()
}

pub fn tools_list_raw(id: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"}).to_string()
}

pub fn fast_session_timing() -> SessionTiming {
    SessionTiming {
        monitor_tick: Duration::from_millis(50),
        response_timeout: Duration::from_secs(5),
        client_wait: Duration::from_secs(2),
        ..SessionTiming::default()
    }
}

pub fn fast_registry_timing() -> RegistryTiming {
    RegistryTiming {
        ping_interval: Duration::from_millis(100),
        cleanup_interval: Duration::from_millis(100),
        manager_dead_after: Duration::from_millis(500),
        session_dead_after: Duration::from_secs(60),
    }
}

/// Connection that plays an MCP server: it answers `initialize`, `tools/list`
/// and `ping`, and ignores notifications.
pub struct FakeConnection {
    connection_id: String,
    worker_id: String,
    client: McpParticipant,
    channels: ConnectionChannels,
    server: Mutex<Option<McpParticipant>>,
    fail_start: bool,
    inactivity: Duration,
    pub run: RunConfig,
    pub forwarded: Mutex<Vec<McpMessage>>,
}

impl FakeConnection {
    fn reply(&self, message: &McpMessage) {
        let Some(id) = message.id().cloned() else {
            return;
        };
        let reply = match message.method() {
            Some("initialize") => McpMessage::response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "0.1.0"}
                }),
            ),
            Some("tools/list") => McpMessage::response(
                id,
                json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
            ),
            Some("ping") => McpMessage::response(id, json!({})),
            _ => McpMessage::error_response(id, -32601, "method not found"),
        };
        self.channels.messages.publish(reply);
    }

    /// Ends the connection the way a crashed worker would.
    pub fn kill(&self) {
        self.channels.errors.publish(McpErrorFrame {
            code: McpErrorCode::ConnectionClosed,
            message: "worker went away".into(),
            data: None,
        });
        self.channels.finish();
    }
}

#[async_trait]
impl WorkerConnection for FakeConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn channels(&self) -> &ConnectionChannels {
        &self.channels
    }

    async fn start(&self) -> Result<McpParticipant, WorkerError> {
        if self.fail_start {
            return Err(WorkerError::Transport("connection refused".into()));
        }
        let server = handshake::initialize(self, &self.client, Duration::from_secs(2)).await?;
        *self.server.lock() = Some(server.clone());
        Ok(server)
    }

    async fn accept_message(&self, message: &McpMessage) -> Result<(), WorkerError> {
        if self.channels.is_done() {
            return Err(WorkerError::Closed);
        }
        self.forwarded.lock().push(message.clone());
        if message.is_request() {
            self.reply(message);
        }
        Ok(())
    }

    async fn close(&self) {
        self.channels.finish();
    }

    fn server(&self) -> Option<McpParticipant> {
        self.server.lock().clone()
    }

    fn inactivity_timeout(&self) -> Duration {
        self.inactivity
    }
}

pub struct FakeWorker {
    id: String,
    worker_type: WorkerType,
    address: String,
    standalone: bool,
    healthy: AtomicBool,
    accepting: AtomicBool,
    fail_connections: AtomicBool,
    fail_launcher: AtomicBool,
    launcher_delay: Mutex<Duration>,
    inactivity: Mutex<Duration>,
    pub launcher_calls: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    on_lost: LostHook,
}

impl FakeWorker {
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_launcher(&self, fail: bool) {
        self.fail_launcher.store(fail, Ordering::SeqCst);
    }

    pub fn set_launcher_delay(&self, delay: Duration) {
        *self.launcher_delay.lock() = delay;
    }

    pub fn set_inactivity(&self, inactivity: Duration) {
        *self.inactivity.lock() = inactivity;
    }

    /// Simulates the worker process dying: live connections end and the
    /// worker reports itself lost.
    pub fn crash(&self) {
        self.set_healthy(false);
        for connection in self.connections() {
            connection.kill();
        }
        (self.on_lost)(&self.id);
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn worker_id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_standalone(&self) -> bool {
        self.standalone
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn is_accepting_jobs(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), WorkerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn create_connection(
        &self,
        input: WorkerConnectionInput,
    ) -> Result<Arc<dyn WorkerConnection>, WorkerError> {
        let connection = Arc::new(FakeConnection {
            connection_id: input.connection_id,
            worker_id: self.id.clone(),
            client: input.mcp_client,
            channels: ConnectionChannels::new(),
            server: Mutex::new(None),
            fail_start: self.fail_connections.load(Ordering::SeqCst),
            inactivity: *self.inactivity.lock(),
            run: input.run,
            forwarded: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }

    /// Answers with the launcher's `params` as the run parameters.
    async fn run_launcher(
        &self,
        request: &LauncherRequest,
    ) -> Result<serde_json::Value, WorkerError> {
        self.launcher_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.launcher_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_launcher.load(Ordering::SeqCst) {
            return Err(WorkerError::Transport("launcher script exited with 1".into()));
        }
        Ok(request.launcher.params.clone())
    }
}

/// Builds [`FakeWorker`]s and keeps them reachable by id.
#[derive(Default)]
pub struct FakeWorkerFactory {
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
}

impl FakeWorkerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn worker(&self, id: &str) -> Option<Arc<FakeWorker>> {
        self.workers.lock().get(id).cloned()
    }

    pub fn total_connections(&self) -> usize {
        self.workers
            .lock()
            .values()
            .map(|worker| worker.connection_count())
            .sum()
    }
}

impl WorkerFactory for FakeWorkerFactory {
    fn build(
        &self,
        worker_id: &str,
        worker_type: WorkerType,
        address: &str,
        standalone: bool,
        on_lost: LostHook,
    ) -> Arc<dyn Worker> {
        let worker = Arc::new(FakeWorker {
            id: worker_id.to_string(),
            worker_type,
            address: address.to_string(),
            standalone,
            healthy: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            fail_connections: AtomicBool::new(false),
            fail_launcher: AtomicBool::new(false),
            launcher_delay: Mutex::new(Duration::ZERO),
            inactivity: Mutex::new(Duration::from_secs(300)),
            launcher_calls: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
            on_lost,
        });
        self.workers
            .lock()
            .insert(worker_id.to_string(), Arc::clone(&worker));
        worker
    }
}

/// A manager served on a real loopback listener.
pub struct ServedManager {
    pub manager: Arc<Manager>,
    pub addr: SocketAddr,
    pub factory: Arc<FakeWorkerFactory>,
    shutdown: CancellationToken,
}

impl ServedManager {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stops serving without running the manager's own shutdown, so its
    /// registry rows stay behind like after a crash.
    pub fn kill(&self) {
        self.shutdown.cancel();
    }
}

pub async fn serve_manager(
    manager_id: &str,
    registry: Arc<dyn RegistryStore>,
) -> Result<ServedManager, Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let factory = FakeWorkerFactory::new();
    let manager = Manager::builder(manager_id, format!("http://{addr}"))
        .registry_store(registry)
        .worker_factory(factory.clone())
        .session_timing(fast_session_timing())
        .build();
    manager.start().await?;

    let shutdown = CancellationToken::new();
    let app = build_router(AppState::new(manager.clone()));
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
    });
    Ok(ServedManager {
        manager,
        addr,
        factory,
        shutdown,
    })
}

/// Collects every frame of a finished stream, failing on the first error.
pub async fn collect_frames(mut stream: FrameStream) -> Result<Vec<SessionFrame>, ClientError> {
    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame?);
    }
    Ok(frames)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
