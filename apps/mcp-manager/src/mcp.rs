//! JSON-RPC framing of MCP messages and the participants negotiated by
//! `initialize`.

use std::sync::Arc;

use manager_sdk::protocol::{
    ImplementationInfo, McpMessageType, McpParticipant, MessageSender, ParticipantKind,
    WireMessage,
};
use serde_json::{Map, Value, json};

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const INITIALIZE_METHOD: &str = "initialize";
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Ids under this prefix belong to messages the manager synthesizes itself.
/// They are never forwarded to audit persistence.
pub const INTERNAL_ID_PREFIX: &str = "mte/";

#[derive(Debug, thiserror::Error)]
pub enum McpParseError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version `{0}`")]
    UnsupportedVersion(String),
    #[error("expected an `{expected}` message")]
    UnexpectedMethod { expected: &'static str },
    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone)]
pub struct McpMessage {
    uuid: String,
    raw: Arc<str>,
    body: Arc<Map<String, Value>>,
    message_type: McpMessageType,
}

impl McpMessage {
    pub fn parse(raw: &str) -> Result<Self, McpParseError> {
        Self::parse_with_uuid(raw, uuid::Uuid::new_v4().to_string())
    }

    pub fn parse_with_uuid(raw: &str, uuid: String) -> Result<Self, McpParseError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(body) = value else {
            return Err(McpParseError::NotAnObject);
        };
        match body.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(McpParseError::UnsupportedVersion(other.to_string())),
            None => return Err(McpParseError::UnsupportedVersion("missing".into())),
        }
        let message_type = classify(&body);
        Ok(Self {
            uuid,
            raw: Arc::from(raw),
            body: Arc::new(body),
            message_type,
        })
    }

    fn from_body(body: Map<String, Value>) -> Self {
        let raw = Value::Object(body.clone()).to_string();
        let message_type = classify(&body);
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            raw: Arc::from(raw.as_str()),
            body: Arc::new(body),
            message_type,
        }
    }

    pub fn request(id: Value, method: &str, params: Option<Value>) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert("method".into(), method.into());
        if let Some(params) = params {
            body.insert("params".into(), params);
        }
        Self::from_body(body)
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("method".into(), method.into());
        if let Some(params) = params {
            body.insert("params".into(), params);
        }
        Self::from_body(body)
    }

    pub fn response(id: Value, result: Value) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert("result".into(), result);
        Self::from_body(body)
    }

    pub fn error_response(id: Value, code: i64, message: &str) -> Self {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert("error".into(), json!({"code": code, "message": message}));
        Self::from_body(body)
    }

    pub fn from_wire(message: &WireMessage) -> Result<Self, McpParseError> {
        Self::parse_with_uuid(&message.raw, message.uuid.clone())
    }

    pub fn to_wire(&self, sender: Option<MessageSender>) -> WireMessage {
        WireMessage {
            uuid: self.uuid.clone(),
            message_type: self.message_type,
            id: self.string_id(),
            method: self.method().map(str::to_string),
            sender,
            raw: self.raw.to_string(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn message_type(&self) -> McpMessageType {
        self.message_type
    }

    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&Value> {
        self.body.get("id").filter(|id| !id.is_null())
    }

    /// The id as a plain string: string ids unquoted, other ids as compact JSON.
    pub fn string_id(&self) -> Option<String> {
        self.id().map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn params(&self) -> Option<&Value> {
        self.body.get("params")
    }

    pub fn result(&self) -> Option<&Value> {
        self.body.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.body.get("error")
    }

    pub fn is_request(&self) -> bool {
        self.message_type == McpMessageType::Request
    }

    pub fn is_initialize_request(&self) -> bool {
        self.is_request() && self.method() == Some(INITIALIZE_METHOD)
    }

    /// True for answers to a request: results and errors alike.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            McpMessageType::Response | McpMessageType::Error
        )
    }

    pub fn is_internal(&self) -> bool {
        self.string_id()
            .is_some_and(|id| id.starts_with(INTERNAL_ID_PREFIX))
    }
}

fn classify(body: &Map<String, Value>) -> McpMessageType {
    let has_id = body.get("id").is_some_and(|id| !id.is_null());
    let has_method = body.get("method").is_some_and(Value::is_string);
    if has_method && has_id {
        McpMessageType::Request
    } else if has_method {
        McpMessageType::Notification
    } else if has_id && body.contains_key("result") {
        McpMessageType::Response
    } else if has_id && body.contains_key("error") {
        McpMessageType::Error
    } else {
        McpMessageType::Unknown
    }
}

fn participant_from(
    kind: ParticipantKind,
    section: &Value,
    info_field: &'static str,
) -> Result<McpParticipant, McpParseError> {
    let info = section
        .get(info_field)
        .ok_or(McpParseError::MissingField(info_field))?;
    let name = info
        .get("name")
        .and_then(Value::as_str)
        .ok_or(McpParseError::MissingField("name"))?;
    let version = info
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(McpParticipant {
        kind,
        info: ImplementationInfo {
            name: name.to_string(),
            version: version.to_string(),
        },
        capabilities: section
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| json!({})),
        protocol_version: section
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION)
            .to_string(),
        instructions: section
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Extracts the client participant from an `initialize` request.
pub fn client_from_initialize(message: &McpMessage) -> Result<McpParticipant, McpParseError> {
    if !message.is_initialize_request() {
        return Err(McpParseError::UnexpectedMethod {
            expected: INITIALIZE_METHOD,
        });
    }
    let params = message
        .params()
        .ok_or(McpParseError::MissingField("params"))?;
    participant_from(ParticipantKind::Client, params, "clientInfo")
}

/// Extracts the server participant from the response to `initialize`.
pub fn server_from_initialize_result(
    message: &McpMessage,
) -> Result<McpParticipant, McpParseError> {
    let result = message
        .result()
        .ok_or(McpParseError::MissingField("result"))?;
    participant_from(ParticipantKind::Server, result, "serverInfo")
}

pub fn initialize_request(client: &McpParticipant, id: Value) -> McpMessage {
    McpMessage::request(
        id,
        INITIALIZE_METHOD,
        Some(json!({
            "protocolVersion": client.protocol_version,
            "capabilities": client.capabilities,
            "clientInfo": {
                "name": client.info.name,
                "version": client.info.version,
            },
        })),
    )
}

/// Builds the `initialize` response a client would have received had its
/// request reached the server, answering under the client's own id.
pub fn initialize_response(server: &McpParticipant, request: &McpMessage) -> McpMessage {
    let mut result = json!({
        "protocolVersion": server.protocol_version,
        "capabilities": server.capabilities,
        "serverInfo": {
            "name": server.info.name,
            "version": server.info.version,
        },
    });
    if let Some(instructions) = &server.instructions {
        result["instructions"] = Value::String(instructions.clone());
    }
    let id = request.id().cloned().unwrap_or(Value::Null);
    McpMessage::response(id, result)
}
