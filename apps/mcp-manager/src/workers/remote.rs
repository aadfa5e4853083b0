//! Client side of worker processes reached over the network.
//!
//! A worker exposes `GET /info`, a `GET /health` event stream, a
//! `/connections/{id}` WebSocket per MCP connection and, for launcher
//! workers, `POST /launcher`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use manager_sdk::protocol::{McpErrorCode, McpErrorFrame, McpOutput, McpParticipant, WorkerType};
use parking_lot::Mutex;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handshake::{self, DEFAULT_HANDSHAKE_TIMEOUT};
use super::{
    ConnectionChannels, LauncherRequest, RunConfig, Worker, WorkerConnection,
    WorkerConnectionInput, WorkerError, WorkerFactory,
};
use crate::log_throttle::{should_log_routine_failure, RoutineLogKind};
use crate::mcp::McpMessage;

/// Invoked with the worker id when a worker's health stream drops.
pub type LostHook = Arc<dyn Fn(&str) + Send + Sync>;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accepting {
    Accepting,
    NotAccepting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub status: HealthStatus,
    pub accepting: Accepting,
}

#[derive(Debug, Clone, Deserialize)]
struct InfoResponse {
    #[serde(default = "default_accepting")]
    accepting: bool,
    #[serde(default)]
    version: Option<String>,
}

fn default_accepting() -> bool {
    true
}

/// Frames the manager sends on a connection socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Start {
        session_id: String,
        connection_id: String,
        mcp_client: McpParticipant,
        run: RunConfig,
    },
    Message {
        raw: String,
    },
    Close,
}

/// Frames a worker sends back on a connection socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        raw: String,
    },
    Error {
        code: McpErrorCode,
        message: String,
    },
    Output {
        output: McpOutput,
    },
    Done {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub fn websocket_url(address: &str, connection_id: &str) -> String {
    let base = address.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/connections/{connection_id}")
}

fn transport(err: impl std::fmt::Display) -> WorkerError {
    WorkerError::Transport(err.to_string())
}

pub struct RemoteWorker {
    id: String,
    worker_type: WorkerType,
    address: String,
    standalone: bool,
    http: reqwest::Client,
    healthy: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    shutdown: CancellationToken,
    on_lost: LostHook,
    inactivity_timeout: Duration,
    handshake_timeout: Duration,
}

impl RemoteWorker {
    pub fn new(
        id: &str,
        worker_type: WorkerType,
        address: &str,
        standalone: bool,
        on_lost: LostHook,
    ) -> Self {
        Self {
            id: id.to_string(),
            worker_type,
            address: address.trim_end_matches('/').to_string(),
            standalone,
            http: reqwest::Client::new(),
            healthy: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            on_lost,
            inactivity_timeout: Duration::from_secs(300),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_timeouts(mut self, inactivity: Duration, handshake: Duration) -> Self {
        self.inactivity_timeout = inactivity;
        self.handshake_timeout = handshake;
        self
    }

    fn spawn_health_watch(&self) {
        let request = self.http.get(format!("{}/health", self.address));
        let healthy = Arc::clone(&self.healthy);
        let accepting = Arc::clone(&self.accepting);
        let shutdown = self.shutdown.clone();
        let on_lost = Arc::clone(&self.on_lost);
        let id = self.id.clone();

        tokio::spawn(async move {
            let mut source = match EventSource::new(request) {
                Ok(source) => source,
                Err(err) => {
                    warn!(worker_id = %id, error = %err, "cannot open worker health stream");
                    healthy.store(false, Ordering::SeqCst);
                    on_lost(&id);
                    return;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = source.next() => event,
                };
                match event {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        match serde_json::from_str::<HealthUpdate>(&message.data) {
                            Ok(update) => {
                                let is_healthy = update.status == HealthStatus::Healthy;
                                let is_accepting = update.accepting == Accepting::Accepting;
                                let was = healthy.swap(is_healthy, Ordering::SeqCst);
                                accepting.store(is_accepting, Ordering::SeqCst);
                                if was != is_healthy {
                                    info!(worker_id = %id, healthy = is_healthy, accepting = is_accepting, "worker health changed");
                                }
                            }
                            Err(err) => {
                                if should_log_routine_failure(RoutineLogKind::WorkerHealth, &id) {
                                    warn!(worker_id = %id, error = %err, "ignoring malformed health update");
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(worker_id = %id, error = %err, "worker health stream failed");
                        break;
                    }
                    None => break,
                }
            }
            source.close();
            healthy.store(false, Ordering::SeqCst);
            if !shutdown.is_cancelled() {
                on_lost(&id);
            }
        });
    }
}

#[async_trait]
impl Worker for RemoteWorker {
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
        let res = self
            .http
            .get(format!("{}/info", self.address))
            .send()
            .await
            .map_err(transport)?;
        if !res.status().is_success() {
            return Err(WorkerError::Protocol(format!(
                "worker info returned {}",
                res.status()
            )));
        }
        let info: InfoResponse = res.json().await.map_err(transport)?;
        self.accepting.store(info.accepting, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        debug!(worker_id = %self.id, version = ?info.version, "worker reachable");
        self.spawn_health_watch();
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.healthy.store(false, Ordering::SeqCst);
    }

    async fn create_connection(
        &self,
        input: WorkerConnectionInput,
    ) -> Result<Arc<dyn WorkerConnection>, WorkerError> {
        if !self.is_accepting_jobs() {
            return Err(WorkerError::NotAccepting(self.id.clone()));
        }
        Ok(Arc::new(RemoteWorkerConnection::new(
            websocket_url(&self.address, &input.connection_id),
            &self.id,
            input,
            self.inactivity_timeout,
            self.handshake_timeout,
        )))
    }

    async fn run_launcher(
        &self,
        request: &LauncherRequest,
    ) -> Result<serde_json::Value, WorkerError> {
        if self.worker_type != WorkerType::Launcher {
            return Err(WorkerError::Unsupported("run_launcher"));
        }
        let res = self
            .http
            .post(format!("{}/launcher", self.address))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(WorkerError::Protocol(format!(
                "launcher returned {status}: {body}"
            )));
        }
        res.json().await.map_err(transport)
    }
}

pub struct RemoteWorkerConnection {
    url: String,
    worker_id: String,
    input: WorkerConnectionInput,
    channels: ConnectionChannels,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    server: Mutex<Option<McpParticipant>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    inactivity_timeout: Duration,
    handshake_timeout: Duration,
}

impl RemoteWorkerConnection {
    fn new(
        url: String,
        worker_id: &str,
        input: WorkerConnectionInput,
        inactivity_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            url,
            worker_id: worker_id.to_string(),
            input,
            channels: ConnectionChannels::new(),
            outbound: Mutex::new(None),
            server: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            inactivity_timeout,
            handshake_timeout,
        }
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), WorkerError> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(WorkerError::Closed)?;
        sender.send(frame).await.map_err(|_| WorkerError::Closed)
    }

    async fn open_socket(&self) -> Result<(), WorkerError> {
        let (socket, _) = connect_async(self.url.as_str()).await.map_err(transport)?;
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);
        *self.outbound.lock() = Some(tx);

        // The writer drains until every sender is gone, so a queued close
        // frame still goes out after `close()` drops the sender.
        let connection_id = self.input.connection_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let payload = match serde_json::to_string(&frame) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(connection_id = %connection_id, error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                let is_close = matches!(frame, ClientFrame::Close);
                if let Err(err) = sink.send(Message::Text(payload)).await {
                    debug!(connection_id = %connection_id, error = %err, "worker socket write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let cancel = self.cancel.clone();
        let channels = self.channels.clone();
        let connection_id = self.input.connection_id.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        channels.errors.publish(McpErrorFrame {
                            code: McpErrorCode::Transport,
                            message: err.to_string(),
                            data: None,
                        });
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Message { raw }) => match McpMessage::parse(&raw) {
                        Ok(message) => {
                            channels.messages.publish(message);
                        }
                        Err(err) => {
                            channels.errors.publish(McpErrorFrame {
                                code: McpErrorCode::Server,
                                message: format!("invalid mcp message from server: {err}"),
                                data: None,
                            });
                        }
                    },
                    Ok(ServerFrame::Error { code, message }) => {
                        channels.errors.publish(McpErrorFrame {
                            code,
                            message,
                            data: None,
                        });
                    }
                    Ok(ServerFrame::Output { output }) => {
                        channels.output.publish(output);
                    }
                    Ok(ServerFrame::Done { reason }) => {
                        debug!(connection_id = %connection_id, ?reason, "worker reported done");
                        break;
                    }
                    Err(err) => {
                        warn!(connection_id = %connection_id, error = %err, "ignoring malformed worker frame");
                    }
                }
            }
            channels.finish();
        });
        Ok(())
    }
}

#[async_trait]
impl WorkerConnection for RemoteWorkerConnection {
    fn connection_id(&self) -> &str {
        &self.input.connection_id
    }

    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn channels(&self) -> &ConnectionChannels {
        &self.channels
    }

    async fn start(&self) -> Result<McpParticipant, WorkerError> {
        self.open_socket().await?;
        self.send_frame(ClientFrame::Start {
            session_id: self.input.session_id.clone(),
            connection_id: self.input.connection_id.clone(),
            mcp_client: self.input.mcp_client.clone(),
            run: self.input.run.clone(),
        })
        .await?;
        let server =
            handshake::initialize(self, &self.input.mcp_client, self.handshake_timeout).await?;
        *self.server.lock() = Some(server.clone());
        Ok(server)
    }

    async fn accept_message(&self, message: &McpMessage) -> Result<(), WorkerError> {
        if self.channels.is_done() {
            return Err(WorkerError::Closed);
        }
        self.send_frame(ClientFrame::Message {
            raw: message.raw().to_string(),
        })
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self.outbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender.try_send(ClientFrame::Close);
        }
        self.cancel.cancel();
        self.channels.finish();
    }

    fn server(&self) -> Option<McpParticipant> {
        self.server.lock().clone()
    }

    fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }
}

/// Builds [`RemoteWorker`]s for registrations and standalone entries.
#[derive(Clone)]
pub struct RemoteWorkerFactory {
    http: reqwest::Client,
    inactivity_timeout: Duration,
    handshake_timeout: Duration,
}

impl RemoteWorkerFactory {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            inactivity_timeout,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl WorkerFactory for RemoteWorkerFactory {
    fn build(
        &self,
        worker_id: &str,
        worker_type: WorkerType,
        address: &str,
        standalone: bool,
        on_lost: LostHook,
    ) -> Arc<dyn Worker> {
        Arc::new(
            RemoteWorker::new(worker_id, worker_type, address, standalone, on_lost)
                .with_http(self.http.clone())
                .with_timeouts(self.inactivity_timeout, self.handshake_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::response::sse::{Event as SseEvent, Sse};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    #[test]
    fn websocket_url_swaps_scheme() {
        assert_eq!(
            websocket_url("http://10.0.0.1:9000/", "c1"),
            "ws://10.0.0.1:9000/connections/c1"
        );
        assert_eq!(
            websocket_url("https://worker.internal", "c2"),
            "wss://worker.internal/connections/c2"
        );
    }

    #[test]
    fn frames_use_type_tags() {
        let frame = serde_json::to_value(ClientFrame::Message { raw: "{}".into() }).unwrap();
        assert_eq!(frame, json!({"type": "message", "raw": "{}"}));

        let done: ServerFrame = serde_json::from_value(json!({"type": "done"})).unwrap();
        assert!(matches!(done, ServerFrame::Done { reason: None }));

        let update: HealthUpdate =
            serde_json::from_value(json!({"status": "healthy", "accepting": "not_accepting"}))
                .unwrap();
        assert_eq!(update.accepting, Accepting::NotAccepting);
    }

    #[tokio::test]
    async fn lost_health_stream_marks_unhealthy_and_reports() {
        let app = Router::new()
            .route("/info", get(|| async { Json(json!({"accepting": true})) }))
            .route(
                "/health",
                get(|| async {
                    let update = SseEvent::default()
                        .json_data(json!({"status": "healthy", "accepting": "accepting"}))
                        .unwrap();
                    Sse::new(futures::stream::iter(vec![Ok::<_, Infallible>(update)]))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<String>();
        let hook: LostHook = Arc::new(move |id: &str| {
            let _ = lost_tx.send(id.to_string());
        });
        let worker = RemoteWorker::new(
            "w1",
            WorkerType::Container,
            &format!("http://{addr}"),
            false,
            hook,
        );
        worker.start().await.unwrap();
        assert!(worker.is_accepting_jobs());

        let lost = tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
            .await
            .unwrap();
        assert_eq!(lost.as_deref(), Some("w1"));
        assert!(!worker.is_healthy());
    }

    #[tokio::test]
    async fn not_accepting_worker_refuses_connections() {
        let worker = RemoteWorker::new(
            "w1",
            WorkerType::Container,
            "http://127.0.0.1:9",
            false,
            Arc::new(|_: &str| {}),
        );
        let input = WorkerConnectionInput {
            session_id: "s1".into(),
            connection_id: "c1".into(),
            mcp_client: crate::mcp::client_from_initialize(
                &McpMessage::parse(
                    r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"clientInfo":{"name":"t","version":"1"}}}"#,
                )
                .unwrap(),
            )
            .unwrap(),
            run: RunConfig::Container(Default::default()),
        };
        assert!(matches!(
            worker.create_connection(input).await,
            Err(WorkerError::NotAccepting(_))
        ));
        assert!(worker.start().await.is_err());
    }
}
