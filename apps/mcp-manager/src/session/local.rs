//! A session owned by this manager: at most one live worker connection,
//! opened lazily and dropped again when idle.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use manager_sdk::protocol::{
    McpErrorCode, McpErrorFrame, McpMessageType, McpOutput, McpParticipant, MessageSender,
    RunRecord, RunStatus, SendMcpMessageRequest, SessionConfigSpec, SessionFrame, SessionRecord,
    SessionSpec, SessionStatus, StreamMcpMessagesRequest, WireMessage,
};
use manager_sdk::registry::StoredSession;
use parking_lot::Mutex;
use session_bus::{Broadcaster, Subscription};
use tokio::sync::{watch, OnceCell, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::resolve_run_config;
use super::{FrameSink, SessionContext};
use crate::audit::now_ms;
use crate::error::{codes, ManagerError, ManagerResult};
use crate::mcp::{self, McpMessage};
use crate::metrics::{ACTIVE_SESSIONS, CONNECTIONS};
use crate::workers::{RunConfig, WorkerConnection, WorkerConnectionInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Closed,
    Expired,
    Error,
    /// Another manager took the session over; the registry row is theirs.
    Moved,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Closed => "closed",
            StopReason::Expired => "expired",
            StopReason::Error => "error",
            StopReason::Moved => "moved",
        }
    }

    fn session_status(self) -> SessionStatus {
        match self {
            StopReason::Closed | StopReason::Moved => SessionStatus::Closed,
            StopReason::Expired => SessionStatus::Expired,
            StopReason::Error => SessionStatus::Error,
        }
    }

    fn run_status(self) -> RunStatus {
        match self {
            StopReason::Closed | StopReason::Moved => RunStatus::Closed,
            StopReason::Expired => RunStatus::Expired,
            StopReason::Error => RunStatus::Error,
        }
    }
}

struct ActiveConnection {
    connection: Arc<dyn WorkerConnection>,
    run: RunRecord,
}

struct SessionState {
    active: Option<ActiveConnection>,
    record: SessionRecord,
    has_error: bool,
    stopped: bool,
}

pub struct LocalSession {
    stored: StoredSession,
    config: SessionConfigSpec,
    audit_session_id: String,
    ctx: Arc<SessionContext>,
    state: RwLock<SessionState>,
    run_config: OnceCell<RunConfig>,
    client: watch::Sender<Option<McpParticipant>>,
    last_interaction: Mutex<Instant>,
    internal_messages: Broadcaster<McpMessage>,
    connection_created: Broadcaster<String>,
    cancel: CancellationToken,
}

async fn emit(sink: &FrameSink, frame: SessionFrame) -> bool {
    sink.send(Ok(frame)).await.is_ok()
}

async fn next<T: Clone + Send + 'static>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Subscriptions to one connection's channels; all `None` while detached.
struct ConnectionFeed {
    messages: Option<Subscription<McpMessage>>,
    errors: Option<Subscription<McpErrorFrame>>,
    output: Option<Subscription<McpOutput>>,
    done: Option<Subscription<()>>,
}

impl ConnectionFeed {
    fn attach(connection: Option<&Arc<dyn WorkerConnection>>) -> Self {
        match connection {
            Some(connection) if !connection.channels().is_done() => Self {
                messages: Some(connection.messages().subscribe()),
                errors: Some(connection.errors().subscribe()),
                output: Some(connection.output().subscribe()),
                done: Some(connection.done().subscribe()),
            },
            _ => Self {
                messages: None,
                errors: None,
                output: None,
                done: None,
            },
        }
    }
}

/// Filters for `StreamMcpMessages`.
struct StreamFilter {
    only_types: Option<HashSet<McpMessageType>>,
    only_ids: Option<HashSet<String>>,
    remaining: Option<HashSet<String>>,
}

impl StreamFilter {
    fn new(request: &StreamMcpMessagesRequest) -> Self {
        let only_ids: Option<HashSet<String>> =
            request.only_ids.as_ref().map(|ids| ids.iter().cloned().collect());
        Self {
            only_types: request
                .only_types
                .as_ref()
                .map(|types| types.iter().copied().collect()),
            remaining: only_ids.clone(),
            only_ids,
        }
    }

    fn accepts(&self, message: &WireMessage) -> bool {
        if let Some(types) = &self.only_types {
            if !types.contains(&message.message_type) {
                return false;
            }
        }
        match (&self.only_ids, &message.id) {
            (Some(ids), Some(id)) => ids.contains(id),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    fn observe(&mut self, message: &WireMessage) {
        if let (Some(remaining), Some(id)) = (&mut self.remaining, &message.id) {
            remaining.remove(id);
        }
    }

    /// True once every id in `only_ids` has been delivered.
    fn complete(&self) -> bool {
        self.remaining.as_ref().is_some_and(HashSet::is_empty)
    }
}

impl LocalSession {
    pub fn new(stored: StoredSession, spec: SessionSpec, ctx: Arc<SessionContext>) -> Arc<Self> {
        let now = now_ms();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: stored.id.clone(),
            manager_id: ctx.manager_id.clone(),
            status: SessionStatus::Active,
            mcp_client: Some(spec.mcp_client.clone()),
            mcp_server: None,
            created_at: now,
            ended_at: None,
            last_ping_at: now,
        };
        ctx.audit.save_session(record.clone());
        ACTIVE_SESSIONS.inc();
        let (client, _) = watch::channel(Some(spec.mcp_client));
        debug!(session_id = %stored.id, session_uuid = %stored.session_uuid, "local session created");

        Arc::new(Self {
            audit_session_id: record.id.clone(),
            stored,
            config: spec.config,
            ctx,
            state: RwLock::new(SessionState {
                active: None,
                record,
                has_error: false,
                stopped: false,
            }),
            run_config: OnceCell::new(),
            client,
            last_interaction: Mutex::new(Instant::now()),
            internal_messages: Broadcaster::new(),
            connection_created: Broadcaster::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn stored(&self) -> &StoredSession {
        &self.stored
    }

    pub fn id(&self) -> &str {
        &self.stored.id
    }

    pub async fn record(&self) -> SessionRecord {
        self.state.read().await.record.clone()
    }

    pub fn client(&self) -> Option<McpParticipant> {
        self.client.borrow().clone()
    }

    pub async fn has_active_connection(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    pub async fn has_error(&self) -> bool {
        self.state.read().await.has_error
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn touch(&self) {
        *self.last_interaction.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_interaction.lock().elapsed()
    }

    fn set_client(&self, client: McpParticipant) {
        self.client.send_replace(Some(client));
    }

    async fn wait_for_client(&self) -> ManagerResult<McpParticipant> {
        let mut rx = self.client.subscribe();
        let client = match tokio::time::timeout(
            self.ctx.timing.client_wait,
            rx.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(client)) => client.clone(),
            _ => None,
        };
        client.ok_or_else(|| {
            ManagerError::invalid_request("mcp client is not initialized")
                .with_code(codes::CLIENT_NOT_INITIALIZED)
                .with_detail("session_id", self.id())
        })
    }

    async fn run_config(&self) -> ManagerResult<RunConfig> {
        self.run_config
            .get_or_try_init(|| resolve_run_config(&self.stored.id, &self.config, &self.ctx.launcher))
            .await
            .cloned()
    }

    /// Resolves the run parameters now, running the launcher for
    /// `*_with_launcher` configs.
    pub async fn prepare_run_config(&self) -> ManagerResult<()> {
        if let Err(err) = self.run_config().await {
            self.ctx.audit.error(
                &self.audit_session_id,
                None,
                codes::GET_LAUNCH_PARAMS_ERROR,
                err.chain(),
                err.details().clone(),
            );
            return Err(err);
        }
        Ok(())
    }

    async fn connection_inputs(&self) -> ManagerResult<(McpParticipant, RunConfig)> {
        let fail = |err: ManagerError| {
            self.record_error(None, &err);
            err
        };
        let client = self.wait_for_client().await.map_err(fail)?;
        let run_config = self.run_config().await.map_err(fail)?;
        Ok((client, run_config))
    }

    fn record_error(&self, run_id: Option<String>, err: &ManagerError) {
        self.ctx.audit.error(
            &self.audit_session_id,
            run_id,
            err.code().unwrap_or(codes::CONNECTION_FAILED),
            err.chain(),
            err.details().clone(),
        );
    }

    fn live(active: &Option<ActiveConnection>) -> Option<(Arc<dyn WorkerConnection>, RunRecord)> {
        active
            .as_ref()
            .filter(|a| !a.connection.channels().is_done())
            .map(|a| (Arc::clone(&a.connection), a.run.clone()))
    }

    /// Returns the live connection, opening one if needed. Concurrent callers
    /// share a single new connection.
    pub async fn ensure_connection(
        self: &Arc<Self>,
    ) -> ManagerResult<(Arc<dyn WorkerConnection>, RunRecord)> {
        if let Some(live) = Self::live(&self.state.read().await.active) {
            return Ok(live);
        }

        // Waiting for the client and the launcher happens outside the write lock.
        let inputs = self.connection_inputs().await;
        let mut state = self.state.write().await;
        if state.stopped {
            return Err(ManagerError::session_not_found(self.id()));
        }
        if let Some(live) = Self::live(&state.active) {
            return Ok(live);
        }
        // A finished connection the monitor has not cleared yet.
        state.active = None;

        let result = match inputs {
            Ok((client, run_config)) => self.open_connection(&mut state, client, run_config).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(session_id = %self.id(), error = %err.chain(), "failed to open worker connection");
            CONNECTIONS.with_label_values(&["failed"]).inc();
        }
        result
    }

    async fn open_connection(
        self: &Arc<Self>,
        state: &mut SessionState,
        client: McpParticipant,
        run_config: RunConfig,
    ) -> ManagerResult<(Arc<dyn WorkerConnection>, RunRecord)> {
        let fail = |err: ManagerError, run_id: Option<String>| {
            self.record_error(run_id, &err);
            err
        };

        let worker_type = run_config.worker_type();
        let key = self.ctx.pool.connection_hash(&run_config);
        let worker = self
            .ctx
            .pool
            .pick_worker_by_hash(worker_type, &key)
            .ok_or_else(|| {
                fail(
                    ManagerError::internal(format!("no healthy {worker_type} worker available"))
                        .with_code(codes::NO_WORKER_AVAILABLE)
                        .with_detail("worker_type", worker_type.as_str()),
                    None,
                )
            })?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let connection = worker
            .create_connection(WorkerConnectionInput {
                session_id: self.stored.id.clone(),
                connection_id: connection_id.clone(),
                mcp_client: client,
                run: run_config,
            })
            .await
            .map_err(|e| {
                fail(
                    ManagerError::from(e)
                        .with_code(codes::CONNECTION_FAILED)
                        .with_detail("worker_id", worker.worker_id()),
                    None,
                )
            })?;

        let now = now_ms();
        let mut run = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.audit_session_id.clone(),
            connection_id: connection_id.clone(),
            worker_id: worker.worker_id().to_string(),
            worker_type: worker.worker_type(),
            status: RunStatus::Active,
            created_at: now,
            ended_at: None,
            last_ping_at: now,
        };
        self.ctx.audit.save_run(run.clone());
        self.spawn_monitor(run.clone(), Arc::clone(&connection));

        let server = match connection.start().await {
            Ok(server) => server,
            Err(err) => {
                connection.close().await;
                run.status = RunStatus::Error;
                run.ended_at = Some(now_ms());
                self.ctx.audit.save_run(run.clone());
                return Err(fail(
                    ManagerError::from(err)
                        .with_code(codes::CONNECTION_FAILED)
                        .with_detail("worker_id", worker.worker_id()),
                    Some(run.id),
                ));
            }
        };

        state.active = Some(ActiveConnection {
            connection: Arc::clone(&connection),
            run: run.clone(),
        });
        state.record.mcp_server = Some(server);
        self.ctx.audit.save_session(state.record.clone());
        self.connection_created.publish(connection_id.clone());
        self.touch();
        CONNECTIONS.with_label_values(&["created"]).inc();
        info!(
            session_id = %self.id(),
            connection_id = %connection_id,
            worker_id = %worker.worker_id(),
            "worker connection established"
        );
        Ok((connection, run))
    }

    fn spawn_monitor(self: &Arc<Self>, run: RunRecord, connection: Arc<dyn WorkerConnection>) {
        let feed = ConnectionFeed::attach(Some(&connection));
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let tick = self.ctx.timing.monitor_tick;
        tokio::spawn(monitor_connection(weak, cancel, tick, run, connection, feed));
    }

    /// Drops `connection_id` as the active connection. Returns false when
    /// another connection (or none) is active.
    async fn clear_connection(&self, connection_id: &str) -> bool {
        let mut state = self.state.write().await;
        match &state.active {
            Some(active) if active.connection.connection_id() == connection_id => {
                state.active = None;
                true
            }
            _ => false,
        }
    }

    async fn mark_error(&self) {
        self.state.write().await.has_error = true;
    }

    fn audit_message(&self, run_id: Option<String>, sender: MessageSender, message: &McpMessage) {
        if message.is_internal() {
            return;
        }
        self.ctx.audit.message(
            &self.audit_session_id,
            &self.stored.id,
            run_id,
            sender,
            message.to_wire(Some(sender)),
        );
    }

    pub async fn send_mcp_message(
        self: &Arc<Self>,
        request: SendMcpMessageRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        self.touch();
        let mut messages = Vec::with_capacity(request.messages.len());
        for raw in &request.messages {
            let message = McpMessage::parse(raw).map_err(|err| {
                ManagerError::invalid_request(format!("invalid mcp message: {err}"))
                    .with_code(codes::INVALID_MCP_MESSAGE)
            })?;
            messages.push(message);
        }
        let (inits, others): (Vec<McpMessage>, Vec<McpMessage>) = messages
            .into_iter()
            .partition(McpMessage::is_initialize_request);
        if inits.len() > 1 {
            return Err(ManagerError::invalid_request(
                "only one initialize request is allowed per call",
            )
            .with_code(codes::INVALID_MCP_MESSAGE));
        }
        let init = inits.into_iter().next();
        if let Some(init) = &init {
            let client = mcp::client_from_initialize(init).map_err(|err| {
                ManagerError::invalid_request(format!("invalid initialize request: {err}"))
                    .with_code(codes::INVALID_MCP_MESSAGE)
            })?;
            self.set_client(client.clone());
            let mut state = self.state.write().await;
            state.record.mcp_client = Some(client);
            self.ctx.audit.save_session(state.record.clone());
        }

        let (connection, run) = self.ensure_connection().await?;
        let record = self.record().await;
        if !emit(&sink, SessionFrame::SessionInfo { session: record }).await
            || !emit(&sink, SessionFrame::RunInfo { run: run.clone() }).await
        {
            return Ok(());
        }

        let mut pending: HashSet<String> = HashSet::new();
        if request.include_responses {
            pending.extend(
                init.iter()
                    .chain(others.iter())
                    .filter(|m| m.is_request())
                    .filter_map(McpMessage::string_id),
            );
        }
        // Subscribe before anything is sent so no reply can be missed.
        let mut internal = request
            .include_responses
            .then(|| self.internal_messages.subscribe());
        let mut feed = if request.include_responses {
            ConnectionFeed::attach(Some(&connection))
        } else {
            ConnectionFeed::attach(None)
        };

        if let Some(init) = &init {
            self.audit_message(Some(run.id.clone()), MessageSender::Client, init);
            let server = connection.server().ok_or_else(|| {
                ManagerError::internal("server participant unavailable after handshake")
            })?;
            let response = mcp::initialize_response(&server, init);
            self.audit_message(Some(run.id.clone()), MessageSender::Server, &response);
            self.internal_messages.publish(response);
        }
        for message in &others {
            self.audit_message(Some(run.id.clone()), MessageSender::Client, message);
            connection.accept_message(message).await.map_err(|err| {
                let err = ManagerError::from(err)
                    .with_code(codes::MCP_MESSAGE_PROCESSING_FAILED)
                    .with_detail("connection_id", connection.connection_id());
                self.record_error(Some(run.id.clone()), &err);
                err
            })?;
        }

        if pending.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::sleep(self.ctx.timing.response_timeout);
        tokio::pin!(deadline);
        loop {
            if pending.is_empty() {
                break;
            }
            let message = tokio::select! {
                biased;
                _ = sink.closed() => break,
                _ = self.cancel.cancelled() => break,
                Some(message) = next(&mut internal) => message,
                Some(message) = next(&mut feed.messages) => message,
                Some(error) = next(&mut feed.errors) => {
                    if !emit(&sink, SessionFrame::McpError { error }).await {
                        break;
                    }
                    continue;
                }
                _ = next(&mut feed.done) => {
                    let error = McpErrorFrame {
                        code: McpErrorCode::ConnectionClosed,
                        message: format!(
                            "connection closed with {} outstanding response(s)",
                            pending.len()
                        ),
                        data: None,
                    };
                    let _ = emit(&sink, SessionFrame::McpError { error }).await;
                    break;
                }
                _ = &mut deadline => {
                    let error = McpErrorFrame {
                        code: McpErrorCode::Timeout,
                        message: format!(
                            "timed out waiting for {} response(s)",
                            pending.len()
                        ),
                        data: None,
                    };
                    let _ = emit(&sink, SessionFrame::McpError { error }).await;
                    break;
                }
            };
            if !message.is_reply() {
                continue;
            }
            let Some(id) = message.string_id() else { continue };
            if !pending.remove(&id) {
                continue;
            }
            let frame = SessionFrame::McpMessage {
                message: message.to_wire(Some(MessageSender::Server)),
                is_replay: false,
            };
            if !emit(&sink, frame).await {
                break;
            }
        }
        self.touch();
        Ok(())
    }

    pub async fn stream_mcp_messages(
        self: &Arc<Self>,
        request: StreamMcpMessagesRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        self.touch();
        let mut filter = StreamFilter::new(&request);
        let mut created = self.connection_created.subscribe();
        let mut internal = Some(self.internal_messages.subscribe());

        if !emit(&sink, SessionFrame::SessionInfo { session: self.record().await }).await {
            return Ok(());
        }

        if let Some(after) = &request.replay_after_uuid {
            let replay = self
                .ctx
                .audit
                .store()
                .list_messages_after(&self.stored.id, after)
                .await?;
            for record in replay {
                if !filter.accepts(&record.message) {
                    continue;
                }
                filter.observe(&record.message);
                let frame = SessionFrame::McpMessage {
                    message: record.message,
                    is_replay: true,
                };
                if !emit(&sink, frame).await {
                    return Ok(());
                }
            }
            if filter.complete() {
                return Ok(());
            }
        }

        // Streams never open a connection; they follow the ones callers open.
        let mut current = Self::live(&self.state.read().await.active);
        let mut attached_before = false;
        let mut touch = tokio::time::interval(self.ctx.timing.stream_touch_interval);

        'attach: loop {
            let mut feed = ConnectionFeed::attach(current.as_ref().map(|(connection, _)| connection));
            if let Some((connection, run)) = &current {
                debug!(session_id = %self.id(), connection_id = %connection.connection_id(), "stream attached");
                if attached_before
                    && !emit(&sink, SessionFrame::SessionInfo { session: self.record().await }).await
                {
                    return Ok(());
                }
                if !emit(&sink, SessionFrame::RunInfo { run: run.clone() }).await {
                    return Ok(());
                }
                attached_before = true;
            }
            loop {
                let message = tokio::select! {
                    biased;
                    _ = sink.closed() => return Ok(()),
                    _ = self.cancel.cancelled() => return Ok(()),
                    Some(message) = next(&mut internal) => message,
                    Some(message) = next(&mut feed.messages) => {
                        if message.is_internal() {
                            continue;
                        }
                        message
                    }
                    Some(error) = next(&mut feed.errors) => {
                        if !emit(&sink, SessionFrame::McpError { error }).await {
                            return Ok(());
                        }
                        continue;
                    }
                    Some(output) = next(&mut feed.output) => {
                        if !emit(&sink, SessionFrame::McpOutput { output }).await {
                            return Ok(());
                        }
                        continue;
                    }
                    _ = next(&mut feed.done) => {
                        current = None;
                        continue 'attach;
                    }
                    id = created.recv() => {
                        let Some(id) = id else { return Ok(()) };
                        if current.as_ref().is_some_and(|(c, _)| c.connection_id() == id) {
                            continue;
                        }
                        current = self.active_connection(&id).await;
                        continue 'attach;
                    }
                    _ = touch.tick() => {
                        self.touch();
                        continue;
                    }
                };
                let wire = message.to_wire(Some(MessageSender::Server));
                if !filter.accepts(&wire) {
                    continue;
                }
                filter.observe(&wire);
                let frame = SessionFrame::McpMessage {
                    message: wire,
                    is_replay: false,
                };
                if !emit(&sink, frame).await {
                    return Ok(());
                }
                if filter.complete() {
                    return Ok(());
                }
            }
        }
    }

    async fn active_connection(
        &self,
        connection_id: &str,
    ) -> Option<(Arc<dyn WorkerConnection>, RunRecord)> {
        Self::live(&self.state.read().await.active)
            .filter(|(connection, _)| connection.connection_id() == connection_id)
    }

    pub async fn get_server_info(self: &Arc<Self>) -> ManagerResult<McpParticipant> {
        self.touch();
        let (connection, _) = self.ensure_connection().await?;
        connection
            .server()
            .ok_or_else(|| ManagerError::internal("server participant unavailable"))
    }

    /// Idle past the threshold with no live connection.
    pub async fn can_discard(&self) -> bool {
        let state = self.state.read().await;
        state.stopped
            || (state.active.is_none() && self.idle_for() >= self.ctx.timing.local_discard_after)
    }

    pub async fn stop(&self, reason: StopReason) {
        self.cancel.cancel();
        let (active, record) = {
            let mut state = self.state.write().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.record.status = reason.session_status();
            state.record.ended_at = Some(now_ms());
            (state.active.take(), state.record.clone())
        };
        if let Some(active) = active {
            active.connection.close().await;
            let mut run = active.run;
            run.status = reason.run_status();
            run.ended_at = Some(now_ms());
            self.ctx.audit.save_run(run);
            CONNECTIONS.with_label_values(&["closed"]).inc();
        }
        self.internal_messages.close();
        self.connection_created.close();
        self.ctx.audit.save_session(record);
        ACTIVE_SESSIONS.dec();
        info!(session_id = %self.id(), reason = reason.as_str(), "session stopped");
    }
}

async fn monitor_connection(
    session: Weak<LocalSession>,
    cancel: CancellationToken,
    tick: Duration,
    mut run: RunRecord,
    connection: Arc<dyn WorkerConnection>,
    mut feed: ConnectionFeed,
) {
    let connection_id = connection.connection_id().to_string();
    let mut ticker = tokio::time::interval(tick);
    ticker.tick().await;
    let mut has_error = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(message) = next(&mut feed.messages) => {
                let Some(session) = session.upgrade() else { break };
                session.audit_message(Some(run.id.clone()), MessageSender::Server, &message);
            }
            Some(error) = next(&mut feed.errors) => {
                has_error = true;
                let Some(session) = session.upgrade() else { break };
                session.mark_error().await;
                let mut details = BTreeMap::new();
                details.insert("connection_id".to_string(), connection_id.clone());
                session.ctx.audit.error(
                    &session.audit_session_id,
                    Some(run.id.clone()),
                    error.code.as_str(),
                    error.message.clone(),
                    details,
                );
                warn!(session_id = %session.id(), connection_id = %connection_id, error = %error.message, "worker connection error");
            }
            Some(output) = next(&mut feed.output) => {
                let Some(session) = session.upgrade() else { break };
                session.ctx.audit.event(&session.audit_session_id, Some(run.id.clone()), output);
            }
            _ = next(&mut feed.done) => {
                let Some(session) = session.upgrade() else { break };
                if session.clear_connection(&connection_id).await {
                    run.status = if has_error { RunStatus::Error } else { RunStatus::Closed };
                    run.ended_at = Some(now_ms());
                    session.ctx.audit.save_run(run.clone());
                    CONNECTIONS.with_label_values(&["closed"]).inc();
                    info!(session_id = %session.id(), connection_id = %connection_id, has_error, "worker connection ended");
                }
                break;
            }
            _ = ticker.tick() => {
                let Some(session) = session.upgrade() else { break };
                if session.idle_for() < connection.inactivity_timeout() {
                    continue;
                }
                if session.clear_connection(&connection_id).await {
                    run.status = RunStatus::Expired;
                    run.ended_at = Some(now_ms());
                    session.ctx.audit.save_run(run.clone());
                    CONNECTIONS.with_label_values(&["expired"]).inc();
                    info!(session_id = %session.id(), connection_id = %connection_id, "closing idle worker connection");
                    connection.close().await;
                }
                break;
            }
        }
    }
    debug!(connection_id = %connection_id, "connection monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(id: Option<&str>, message_type: McpMessageType) -> WireMessage {
        WireMessage {
            uuid: uuid::Uuid::new_v4().to_string(),
            message_type,
            id: id.map(str::to_string),
            method: None,
            sender: Some(MessageSender::Server),
            raw: "{}".into(),
        }
    }

    #[test]
    fn filter_by_ids_completes_when_all_seen() {
        let mut filter = StreamFilter::new(&StreamMcpMessagesRequest {
            only_ids: Some(vec!["1".into(), "2".into()]),
            ..Default::default()
        });
        let first = wire(Some("1"), McpMessageType::Response);
        assert!(filter.accepts(&first));
        assert!(!filter.accepts(&wire(Some("3"), McpMessageType::Response)));
        assert!(!filter.accepts(&wire(None, McpMessageType::Notification)));
        filter.observe(&first);
        assert!(!filter.complete());
        filter.observe(&wire(Some("2"), McpMessageType::Error));
        assert!(filter.complete());
    }

    #[test]
    fn filter_by_types() {
        let filter = StreamFilter::new(&StreamMcpMessagesRequest {
            only_types: Some(vec![McpMessageType::Notification]),
            ..Default::default()
        });
        assert!(filter.accepts(&wire(None, McpMessageType::Notification)));
        assert!(!filter.accepts(&wire(Some("1"), McpMessageType::Response)));
        assert!(!filter.complete());
    }

    #[test]
    fn stop_reasons_map_to_statuses() {
        assert_eq!(StopReason::Moved.session_status(), SessionStatus::Closed);
        assert_eq!(StopReason::Expired.run_status(), RunStatus::Expired);
        assert_eq!(StopReason::Error.as_str(), "error");
    }
}
