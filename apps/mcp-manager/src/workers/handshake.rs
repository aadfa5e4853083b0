use std::time::Duration;

use manager_sdk::protocol::McpParticipant;
use serde_json::Value;
use tracing::debug;

use super::{WorkerConnection, WorkerError};
use crate::mcp::{self, McpMessage, INITIALIZED_NOTIFICATION, INTERNAL_ID_PREFIX};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `initialize` / `notifications/initialized` against the server behind
/// `connection` on behalf of `client`. The request id lives in the internal
/// namespace so neither audit nor response correlation ever sees it.
pub async fn initialize(
    connection: &dyn WorkerConnection,
    client: &McpParticipant,
    timeout: Duration,
) -> Result<McpParticipant, WorkerError> {
    let request_id = format!("{INTERNAL_ID_PREFIX}init/{}", uuid::Uuid::new_v4());
    // Subscribe before sending so a fast reply cannot slip past.
    let mut replies = connection.messages().subscribe();
    connection
        .accept_message(&mcp::initialize_request(
            client,
            Value::String(request_id.clone()),
        ))
        .await?;

    let response = tokio::time::timeout(timeout, async {
        while let Some(message) = replies.recv().await {
            if message.is_reply() && message.string_id().as_deref() == Some(request_id.as_str()) {
                return Ok(message);
            }
        }
        Err(WorkerError::Closed)
    })
    .await
    .map_err(|_| WorkerError::Timeout("initialize response"))??;

    let server = server_from_response(&response)?;
    connection
        .accept_message(&McpMessage::notification(INITIALIZED_NOTIFICATION, None))
        .await?;
    debug!(
        connection_id = %connection.connection_id(),
        server = %server.info.name,
        protocol_version = %server.protocol_version,
        "mcp handshake complete"
    );
    Ok(server)
}

fn server_from_response(response: &McpMessage) -> Result<McpParticipant, WorkerError> {
    if let Some(error) = response.error() {
        return Err(WorkerError::Handshake(format!(
            "server rejected initialize: {error}"
        )));
    }
    mcp::server_from_initialize_result(response)
        .map_err(|err| WorkerError::Handshake(err.to_string()))
}
