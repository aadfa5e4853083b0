//! Proxy for a session owned by a peer manager.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use manager_sdk::protocol::{McpParticipant, SendMcpMessageRequest, StreamMcpMessagesRequest};
use manager_sdk::registry::StoredSession;
use manager_sdk::{ClientError, FrameStream, ManagerClient};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::FrameSink;
use crate::error::{ManagerError, ManagerResult};

pub struct RemoteSession {
    stored: StoredSession,
    client: ManagerClient,
    discard_after: Duration,
    last_interaction: Mutex<Instant>,
}

impl RemoteSession {
    pub fn new(stored: StoredSession, client: ManagerClient, discard_after: Duration) -> Arc<Self> {
        debug!(session_id = %stored.id, owner = %stored.manager_id, "remote session proxy created");
        Arc::new(Self {
            stored,
            client,
            discard_after,
            last_interaction: Mutex::new(Instant::now()),
        })
    }

    pub fn stored(&self) -> &StoredSession {
        &self.stored
    }

    pub fn owner(&self) -> &str {
        &self.stored.manager_id
    }

    fn touch(&self) {
        *self.last_interaction.lock() = Instant::now();
    }

    pub fn can_discard(&self) -> bool {
        self.last_interaction.lock().elapsed() >= self.discard_after
    }

    pub async fn send_mcp_message(
        &self,
        request: SendMcpMessageRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        self.touch();
        let stream = self
            .client
            .send_mcp_message(&self.stored.id, &request)
            .await?;
        self.pipe(stream, sink).await
    }

    pub async fn stream_mcp_messages(
        &self,
        request: StreamMcpMessagesRequest,
        sink: FrameSink,
    ) -> ManagerResult<()> {
        self.touch();
        let stream = self
            .client
            .stream_mcp_messages(&self.stored.id, &request)
            .await?;
        self.pipe(stream, sink).await
    }

    pub async fn get_server_info(&self) -> ManagerResult<McpParticipant> {
        self.touch();
        Ok(self.client.get_server_info(&self.stored.id).await?)
    }

    pub async fn discard(&self) -> ManagerResult<()> {
        self.client.discard_session(&self.stored.id).await?;
        Ok(())
    }

    /// Forwards the owner's frames. Once a frame has gone out, a transport
    /// failure is reported without the unreachable code so the router does
    /// not replay the call on a new owner.
    async fn pipe(&self, mut stream: FrameStream, sink: FrameSink) -> ManagerResult<()> {
        let mut forwarded = false;
        loop {
            let item = tokio::select! {
                _ = sink.closed() => return Ok(()),
                item = stream.next() => item,
            };
            match item {
                None => return Ok(()),
                Some(Ok(frame)) => {
                    if sink.send(Ok(frame)).await.is_err() {
                        return Ok(());
                    }
                    forwarded = true;
                    self.touch();
                }
                Some(Err(err)) if forwarded => return Err(mid_stream_error(err)),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

fn mid_stream_error(err: ClientError) -> ManagerError {
    match err {
        ClientError::Api { body, .. } => {
            ManagerError::internal(format!("owning manager failed: {}", body.message))
        }
        other => ManagerError::internal("stream from owning manager failed").with_source(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn stored() -> StoredSession {
        StoredSession {
            id: "s1".into(),
            manager_id: "m2".into(),
            session_uuid: "u1".into(),
            created_at: 0,
            last_ping_at: 0,
            spec: None,
        }
    }

    #[tokio::test]
    async fn unreachable_owner_before_first_frame_keeps_code() {
        let client = ManagerClient::new("http://127.0.0.1:9").unwrap();
        let session = RemoteSession::new(stored(), client, Duration::from_secs(60));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let err = session
            .send_mcp_message(SendMcpMessageRequest::default(), tx)
            .await
            .unwrap_err();
        assert!(err.has_code(codes::OWNER_UNREACHABLE), "{err:?}");
    }

    #[tokio::test]
    async fn mid_stream_failure_drops_unreachable_code() {
        let client = ManagerClient::new("http://127.0.0.1:9").unwrap();
        let source = client
            .send_mcp_message("s1", &SendMcpMessageRequest::default())
            .await
            .unwrap()
            .next()
            .await
            .unwrap()
            .unwrap_err();
        assert!(source.is_unreachable());
        let err = mid_stream_error(source);
        assert_eq!(err.code(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn discardable_after_idle_period() {
        let client = ManagerClient::new("http://127.0.0.1:9").unwrap();
        let session = RemoteSession::new(stored(), client, Duration::from_secs(60));
        assert!(!session.can_discard());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.can_discard());
    }
}
