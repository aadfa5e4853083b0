use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::Stream;
use manager_sdk::protocol::{
    CreateSessionRequest, CreateSessionResponse, DiscardSessionResponse, McpParticipant,
    SendMcpMessageRequest, StreamMcpMessagesRequest,
};
use tracing::debug;

use super::sse::frame_stream;
use super::ApiResult;
use crate::error::ManagerError;
use crate::state::AppState;

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let session = state.sessions().upsert_session(request).await?;
    let stored = session.stored();
    Ok(Json(CreateSessionResponse {
        session_id: stored.id.clone(),
        manager_id: stored.manager_id.clone(),
        session_uuid: stored.session_uuid.clone(),
    }))
}

pub async fn send_mcp_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SendMcpMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ManagerError> {
    debug!(session_id = %session_id, messages = request.messages.len(), "send mcp message");
    let sessions = state.sessions();
    frame_stream(move |sink| async move {
        sessions
            .with_session(&session_id, |session| {
                let request = request.clone();
                let sink = sink.clone();
                async move { session.send_mcp_message(request, sink).await }
            })
            .await
    })
    .await
}

pub async fn stream_mcp_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<StreamMcpMessagesRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ManagerError> {
    debug!(session_id = %session_id, "stream mcp messages");
    let sessions = state.sessions();
    frame_stream(move |sink| async move {
        sessions
            .with_session(&session_id, |session| {
                let request = request.clone();
                let sink = sink.clone();
                async move { session.stream_mcp_messages(request, sink).await }
            })
            .await
    })
    .await
}

pub async fn get_server_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<McpParticipant> {
    let server = state
        .sessions()
        .with_session(&session_id, |session| async move {
            session.get_server_info().await
        })
        .await?;
    Ok(Json(server))
}

pub async fn discard_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<DiscardSessionResponse> {
    state.sessions().discard_session(&session_id).await?;
    Ok(Json(DiscardSessionResponse { session_id }))
}
