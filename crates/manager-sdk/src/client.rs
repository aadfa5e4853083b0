use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::{
    ApiErrorBody, CreateSessionRequest, CreateSessionResponse, DiscardSessionResponse,
    ListManagersResponse, McpParticipant, ManagerInfoResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, SendMcpMessageRequest, SessionFrame, StreamMcpMessagesRequest,
    ERROR_EVENT, FRAME_EVENT,
};

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SessionFrame, ClientError>> + Send>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a manager's RPC surface, used by tools and by managers that
/// proxy sessions owned by a peer.
#[derive(Clone, Debug)]
pub struct ManagerClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("manager unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("manager returned {status}: {} ({})", .body.message, .body.error)]
    Api { status: u16, body: ApiErrorBody },
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream failed: {0}")]
    Stream(String),
}

impl ClientError {
    /// True when the manager could not be reached at all, as opposed to a
    /// manager that answered with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClientError::Unreachable(_))
    }

    pub fn api_body(&self) -> Option<&ApiErrorBody> {
        match self {
            ClientError::Api { body, .. } => Some(body),
            _ => None,
        }
    }
}

fn classify(err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Unreachable(err)
    } else {
        ClientError::Http(err)
    }
}

async fn error_from_response(res: reqwest::Response) -> ClientError {
    let status = res.status().as_u16();
    let text = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => ClientError::Api { status, body },
        Err(_) => ClientError::UnexpectedStatus { status, body: text },
    }
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T>(&self, request: RequestBuilder) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let res = request.send().await.map_err(classify)?;
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            Err(error_from_response(res).await)
        }
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ClientError> {
        self.send_json(self.http.post(self.url("/sessions")).json(request))
            .await
    }

    pub async fn send_mcp_message(
        &self,
        session_id: &str,
        request: &SendMcpMessageRequest,
    ) -> Result<FrameStream, ClientError> {
        let builder = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/messages")))
            .json(request);
        self.open_stream(builder)
    }

    pub async fn stream_mcp_messages(
        &self,
        session_id: &str,
        request: &StreamMcpMessagesRequest,
    ) -> Result<FrameStream, ClientError> {
        let builder = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/stream")))
            .json(request);
        self.open_stream(builder)
    }

    pub async fn get_server_info(&self, session_id: &str) -> Result<McpParticipant, ClientError> {
        self.send_json(
            self.http
                .get(self.url(&format!("/sessions/{session_id}/server"))),
        )
        .await
    }

    pub async fn discard_session(
        &self,
        session_id: &str,
    ) -> Result<DiscardSessionResponse, ClientError> {
        self.send_json(
            self.http
                .delete(self.url(&format!("/sessions/{session_id}"))),
        )
        .await
    }

    pub async fn register_worker(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<RegisterWorkerResponse, ClientError> {
        self.send_json(self.http.post(self.url("/workers")).json(request))
            .await
    }

    pub async fn list_managers(&self) -> Result<ListManagersResponse, ClientError> {
        self.send_json(self.http.get(self.url("/managers"))).await
    }

    pub async fn manager_info(&self) -> Result<ManagerInfoResponse, ClientError> {
        self.send_json(self.http.get(self.url("/manager"))).await
    }

    /// Opens an SSE stream of frames. The stream never reconnects: it ends on
    /// the server closing it, and yields one error item before ending when the
    /// server reports a failure.
    fn open_stream(&self, builder: RequestBuilder) -> Result<FrameStream, ClientError> {
        let source = EventSource::new(builder)
            .map_err(|_| ClientError::Stream("request body cannot be streamed".into()))?;

        let stream = futures::stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        let item = match message.event.as_str() {
                            FRAME_EVENT => serde_json::from_str::<SessionFrame>(&message.data)
                                .map_err(ClientError::from),
                            ERROR_EVENT => {
                                source.close();
                                let err = match serde_json::from_str::<ApiErrorBody>(&message.data)
                                {
                                    Ok(body) => ClientError::Api { status: 200, body },
                                    Err(err) => ClientError::Decode(err),
                                };
                                return Some((Err(err), None));
                            }
                            _ => continue,
                        };
                        return Some((item, Some(source)));
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(reqwest_eventsource::Error::InvalidStatusCode(_, res))) => {
                        source.close();
                        return Some((Err(error_from_response(res).await), None));
                    }
                    Some(Err(reqwest_eventsource::Error::Transport(err))) => {
                        source.close();
                        return Some((Err(classify(err)), None));
                    }
                    Some(Err(other)) => {
                        source.close();
                        return Some((Err(ClientError::Stream(other.to_string())), None));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
