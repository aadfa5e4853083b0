//! Sessions as seen by one manager: owned here ([`LocalSession`]) or proxied
//! to the owning peer ([`RemoteSession`]), behind the [`Sessions`] router.

pub mod config;
pub mod local;
pub mod managers;
pub mod remote;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use manager_sdk::protocol::{
    McpParticipant, SendMcpMessageRequest, SessionFrame, StreamMcpMessagesRequest,
};
use manager_sdk::registry::StoredSession;
use tokio::sync::mpsc;

use crate::audit::AuditLog;
use crate::error::{ManagerError, ManagerResult};
use crate::workers::{Launcher, WorkerPool};

pub use local::{LocalSession, StopReason};
pub use remote::RemoteSession;
pub use router::Sessions;

/// Receives the frames of a streaming RPC. A closed receiver means the
/// caller went away and the producer should stop.
pub type FrameSink = mpsc::Sender<Result<SessionFrame, ManagerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Period of the connection monitor's idle check.
    pub monitor_tick: Duration,
    /// How long `SendMcpMessage` waits for responses.
    pub response_timeout: Duration,
    pub local_discard_after: Duration,
    pub remote_discard_after: Duration,
    /// Bound on waiting for the client participant before connecting.
    pub client_wait: Duration,
    /// Interaction refresh period while a stream is attached.
    pub stream_touch_interval: Duration,
    pub discard_sweep: Duration,
    pub session_ping: Duration,
    pub state_dump: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            monitor_tick: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            local_discard_after: Duration::from_secs(5 * 60),
            remote_discard_after: Duration::from_secs(60),
            client_wait: Duration::from_secs(20),
            stream_touch_interval: Duration::from_secs(15),
            discard_sweep: Duration::from_secs(30),
            session_ping: Duration::from_secs(10),
            state_dump: Duration::from_secs(60),
        }
    }
}

/// Collaborators shared by every local session of a manager.
pub struct SessionContext {
    pub manager_id: String,
    pub pool: Arc<WorkerPool>,
    pub launcher: Launcher,
    pub audit: AuditLog,
    pub timing: SessionTiming,
}

#[derive(Clone)]
pub enum Session {
    Local(Arc<LocalSession>),
    Remote(Arc<RemoteSession>),
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("placement", &self.placement())
            .field("id", &self.id())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.stored().id
    }

    pub fn stored(&self) -> &StoredSession {
        match self {
            Session::Local(s) => s.stored(),
            Session::Remote(s) => s.stored(),
        }
    }

    pub fn placement(&self) -> &'static str {
        match self {
            Session::Local(_) => "local",
            Session::Remote(_) => "remote",
        }
    }

    pub fn is_same(&self, other: &Session) -> bool {
        match (self, other) {
            (Session::Local(a), Session::Local(b)) => Arc::ptr_eq(a, b),
            (Session::Remote(a), Session::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub async fn send_mcp_message(
        &self,
        request: SendMcpMessageRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        match self {
            Session::Local(s) => s.send_mcp_message(request, sink).await,
            Session::Remote(s) => s.send_mcp_message(request, sink).await,
        }
    }

    pub async fn stream_mcp_messages(
        &self,
        request: StreamMcpMessagesRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        match self {
            Session::Local(s) => s.stream_mcp_messages(request, sink).await,
            Session::Remote(s) => s.stream_mcp_messages(request, sink).await,
        }
    }

    pub async fn get_server_info(&self) -> ManagerResult<McpParticipant> {
        match self {
            Session::Local(s) => s.get_server_info().await,
            Session::Remote(s) => s.get_server_info().await,
        }
    }

    pub async fn can_discard(&self) -> bool {
        match self {
            Session::Local(s) => s.can_discard().await,
            Session::Remote(s) => s.can_discard(),
        }
    }
}
