//! Worker abstraction: processes that run MCP servers on the manager's behalf,
//! and the per-session connections opened through them.

pub mod handshake;
pub mod hash;
pub mod launcher;
pub mod pool;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use manager_sdk::protocol::{
    ContainerRunConfig, LambdaRunConfig, McpErrorFrame, McpOutput, McpParticipant,
    RemoteRunConfig, WorkerType,
};
use serde::{Deserialize, Serialize};
use session_bus::Broadcaster;

use crate::mcp::McpMessage;

pub use launcher::{LaunchKind, Launcher, LauncherRequest};
pub use pool::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker `{0}` is not accepting jobs")]
    NotAccepting(String),
    #[error("no healthy {0} worker available")]
    NoWorkerAvailable(WorkerType),
    #[error("worker transport failed: {0}")]
    Transport(String),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("mcp handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("`{0}` is not supported by this worker")]
    Unsupported(&'static str),
}

/// Concrete run parameters for one connection, after any launcher has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunConfig {
    Container(ContainerRunConfig),
    Remote(RemoteRunConfig),
    Lambda(LambdaRunConfig),
}

impl RunConfig {
    /// Lambda servers are reached through remote workers.
    pub fn worker_type(&self) -> WorkerType {
        match self {
            RunConfig::Container(_) => WorkerType::Container,
            RunConfig::Remote(_) | RunConfig::Lambda(_) => WorkerType::Remote,
        }
    }

    /// Stable routing key: equal configurations always map to equal keys.
    pub fn connection_hash(&self) -> Vec<u8> {
        match self {
            RunConfig::Container(c) => c.image.as_bytes().to_vec(),
            RunConfig::Remote(r) => r.server_uri.as_bytes().to_vec(),
            RunConfig::Lambda(l) => l.provider_resource_access_identifier.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConnectionInput {
    pub session_id: String,
    pub connection_id: String,
    pub mcp_client: McpParticipant,
    pub run: RunConfig,
}

/// Fan-out channels every connection exposes. `done` carries no values: it is
/// closed exactly once when the connection ends, which also closes the rest.
#[derive(Clone, Default)]
pub struct ConnectionChannels {
    pub messages: Broadcaster<McpMessage>,
    pub errors: Broadcaster<McpErrorFrame>,
    pub output: Broadcaster<McpOutput>,
    pub done: Broadcaster<()>,
}

impl ConnectionChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(&self) {
        self.done.close();
        self.messages.close();
        self.errors.close();
        self.output.close();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }
}

#[async_trait]
pub trait WorkerConnection: Send + Sync {
    fn connection_id(&self) -> &str;

    fn worker_id(&self) -> &str;

    fn channels(&self) -> &ConnectionChannels;

    /// Opens the transport and completes the MCP handshake, returning the
    /// server participant.
    async fn start(&self) -> Result<McpParticipant, WorkerError>;

    async fn accept_message(&self, message: &McpMessage) -> Result<(), WorkerError>;

    async fn close(&self);

    /// Server participant once the handshake completed.
    fn server(&self) -> Option<McpParticipant>;

    fn inactivity_timeout(&self) -> Duration;

    fn messages(&self) -> &Broadcaster<McpMessage> {
        &self.channels().messages
    }

    fn errors(&self) -> &Broadcaster<McpErrorFrame> {
        &self.channels().errors
    }

    fn output(&self) -> &Broadcaster<McpOutput> {
        &self.channels().output
    }

    fn done(&self) -> &Broadcaster<()> {
        &self.channels().done
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub address: String,
    pub healthy: bool,
    pub accepting_jobs: bool,
    pub standalone: bool,
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn worker_id(&self) -> &str;

    fn worker_type(&self) -> WorkerType;

    fn address(&self) -> &str;

    /// Statically configured workers never self-unregister.
    fn is_standalone(&self) -> bool;

    fn is_healthy(&self) -> bool;

    fn is_accepting_jobs(&self) -> bool;

    async fn start(&self) -> Result<(), WorkerError>;

    async fn stop(&self);

    async fn create_connection(
        &self,
        input: WorkerConnectionInput,
    ) -> Result<Arc<dyn WorkerConnection>, WorkerError>;

    async fn run_launcher(
        &self,
        _request: &LauncherRequest,
    ) -> Result<serde_json::Value, WorkerError> {
        Err(WorkerError::Unsupported("run_launcher"))
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id().to_string(),
            worker_type: self.worker_type(),
            address: self.address().to_string(),
            healthy: self.is_healthy(),
            accepting_jobs: self.is_accepting_jobs(),
            standalone: self.is_standalone(),
        }
    }
}

/// Builds workers from registration requests. The manager uses
/// [`remote::RemoteWorkerFactory`]; tests plug in in-process workers.
pub trait WorkerFactory: Send + Sync {
    fn build(
        &self,
        worker_id: &str,
        worker_type: WorkerType,
        address: &str,
        standalone: bool,
        on_lost: remote::LostHook,
    ) -> Arc<dyn Worker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_routes_lambda_through_remote_workers() {
        let lambda = RunConfig::Lambda(LambdaRunConfig {
            provider_resource_access_identifier: "arn:aws:lambda:fn".into(),
            env: Default::default(),
        });
        assert_eq!(lambda.worker_type(), WorkerType::Remote);
        assert_eq!(lambda.connection_hash(), b"arn:aws:lambda:fn".to_vec());

        let container = RunConfig::Container(ContainerRunConfig {
            image: "demo:latest".into(),
            command: None,
            args: vec![],
            env: Default::default(),
        });
        let same = container.clone();
        assert_eq!(container.connection_hash(), same.connection_hash());
        assert_eq!(container.worker_type(), WorkerType::Container);
    }

    #[tokio::test]
    async fn finishing_channels_ends_late_subscribers() {
        let channels = ConnectionChannels::new();
        let mut early = channels.done.subscribe();
        channels.finish();
        assert!(early.recv().await.is_none());
        let mut late = channels.messages.subscribe();
        assert!(late.recv().await.is_none());
        assert!(channels.is_done());
    }
}
