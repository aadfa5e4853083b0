mod cluster;
mod sessions;
pub mod sse;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::ManagerError;
use crate::state::AppState;

pub use cluster::*;
pub use sessions::*;

pub type ApiResult<T> = Result<Json<T>, ManagerError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", axum::routing::delete(discard_session))
        .route("/sessions/:session_id/messages", post(send_mcp_message))
        .route("/sessions/:session_id/stream", post(stream_mcp_messages))
        .route("/sessions/:session_id/server", get(get_server_info))
        .route("/workers", post(register_worker))
        .route("/managers", get(list_managers))
        .route("/manager", get(manager_info))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
