//! Wire types for the manager RPC surface.
//!
//! Unary RPCs exchange these as JSON bodies. Streaming RPCs carry
//! [`SessionFrame`] values as Server-Sent Events named [`FRAME_EVENT`]; a
//! failure after the stream has started arrives as a single [`ERROR_EVENT`]
//! holding an [`ApiErrorBody`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ManagerRecord;

pub const FRAME_EVENT: &str = "frame";
pub const ERROR_EVENT: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Internal,
    Timeout,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Container,
    Remote,
    Launcher,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Container => "container",
            WorkerType::Remote => "remote",
            WorkerType::Launcher => "launcher",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(WorkerType::Container),
            "remote" => Ok(WorkerType::Remote),
            "launcher" => Ok(WorkerType::Launcher),
            other => Err(format!("unknown worker type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// One side of an MCP conversation as negotiated by `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpParticipant {
    #[serde(rename = "type")]
    pub kind: ParticipantKind,
    pub info: ImplementationInfo,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpMessageType {
    Request,
    Notification,
    Response,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub uuid: String,
    pub message_type: McpMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<MessageSender>,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpErrorCode {
    Timeout,
    ConnectionClosed,
    Transport,
    Server,
    Internal,
    #[serde(other)]
    Unknown,
}

impl McpErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpErrorCode::Timeout => "timeout",
            McpErrorCode::ConnectionClosed => "connection_closed",
            McpErrorCode::Transport => "transport",
            McpErrorCode::Server => "server",
            McpErrorCode::Internal => "internal",
            McpErrorCode::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpErrorFrame {
    pub code: McpErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpOutput {
    pub stream: OutputStream,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Closed,
    Expired,
    Error,
}

/// Audit view of a session as one manager generation sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub external_id: String,
    pub manager_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_client: Option<McpParticipant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<McpParticipant>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub last_ping_at: i64,
}

/// One connection attempt of a session against a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub session_id: String,
    pub connection_id: String,
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub status: RunStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub last_ping_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFrame {
    SessionInfo { session: SessionRecord },
    RunInfo { run: RunRecord },
    McpMessage { message: WireMessage, is_replay: bool },
    McpError { error: McpErrorFrame },
    McpOutput { output: McpOutput },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerRunConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteProtocol {
    #[default]
    Sse,
    StreamableHttp,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteRunConfig {
    pub server_uri: String,
    #[serde(default)]
    pub protocol: RemoteProtocol,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LambdaRunConfig {
    pub provider_resource_access_identifier: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Input for a launcher worker, which turns it into concrete run parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub script: String,
    #[serde(default)]
    pub params: Value,
}

/// Backend selection for a session. Exactly one field must be set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_with_launcher: Option<LauncherConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_with_arguments: Option<ContainerRunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_with_launcher: Option<LauncherConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_with_server: Option<RemoteRunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_with_launcher: Option<LauncherConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_with_server: Option<LambdaRunConfig>,
}

impl SessionConfigSpec {
    pub fn container(config: ContainerRunConfig) -> Self {
        Self {
            container_with_arguments: Some(config),
            ..Self::default()
        }
    }

    pub fn remote(config: RemoteRunConfig) -> Self {
        Self {
            remote_with_server: Some(config),
            ..Self::default()
        }
    }

    /// Names of the backend kinds that are set, in declaration order.
    pub fn kinds_present(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.container_with_launcher.is_some() {
            kinds.push("container_with_launcher");
        }
        if self.container_with_arguments.is_some() {
            kinds.push("container_with_arguments");
        }
        if self.remote_with_launcher.is_some() {
            kinds.push("remote_with_launcher");
        }
        if self.remote_with_server.is_some() {
            kinds.push("remote_with_server");
        }
        if self.lambda_with_launcher.is_some() {
            kinds.push("lambda_with_launcher");
        }
        if self.lambda_with_server.is_some() {
            kinds.push("lambda_with_server");
        }
        kinds
    }
}

/// Creation parameters kept with the registry row so any manager can rebuild
/// the session after a takeover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub config: SessionConfigSpec,
    pub mcp_client: McpParticipant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub config: SessionConfigSpec,
    pub mcp_client: McpParticipant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub manager_id: String,
    pub session_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendMcpMessageRequest {
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub include_responses: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMcpMessagesRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_types: Option<Vec<McpMessageType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_after_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: String,
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListManagersResponse {
    pub managers: Vec<ManagerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerInfoResponse {
    pub manager: ManagerRecord,
    pub session_count: usize,
    pub worker_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_spec_reports_every_kind_set() {
        let empty = SessionConfigSpec::default();
        assert!(empty.kinds_present().is_empty());

        let mut both = SessionConfigSpec::container(ContainerRunConfig {
            image: "demo:latest".into(),
            ..Default::default()
        });
        both.remote_with_server = Some(RemoteRunConfig {
            server_uri: "https://mcp.example.com/sse".into(),
            ..Default::default()
        });
        assert_eq!(
            both.kinds_present(),
            vec!["container_with_arguments", "remote_with_server"]
        );
    }

    #[test]
    fn frames_are_tagged_by_type() {
        let frame = SessionFrame::McpError {
            error: McpErrorFrame {
                code: McpErrorCode::Timeout,
                message: "timed out".into(),
                data: None,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "mcp_error", "error": {"code": "timeout", "message": "timed out"}})
        );
    }

    #[test]
    fn unknown_error_codes_decode_as_unknown() {
        let frame: McpErrorFrame =
            serde_json::from_value(json!({"code": "worker_exploded", "message": "x"})).unwrap();
        assert_eq!(frame.code, McpErrorCode::Unknown);
    }

    #[test]
    fn error_body_omits_empty_details() {
        let body = ApiErrorBody {
            error: ErrorKind::NotFound,
            code: None,
            message: "session not found".into(),
            details: BTreeMap::new(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, json!({"error": "not_found", "message": "session not found"}));
    }
}
