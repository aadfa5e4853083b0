use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use manager_sdk::protocol::{
    ListManagersResponse, ManagerInfoResponse, RegisterWorkerRequest, RegisterWorkerResponse,
};
use tracing::info;

use super::ApiResult;
use crate::metrics;
use crate::state::AppState;

pub async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> ApiResult<RegisterWorkerResponse> {
    info!(
        worker_id = %request.worker_id,
        worker_type = %request.worker_type,
        address = %request.address,
        "worker registration"
    );
    Ok(Json(state.manager().register_worker(request).await?))
}

pub async fn list_managers(State(state): State<AppState>) -> ApiResult<ListManagersResponse> {
    Ok(Json(state.manager().list_managers().await?))
}

pub async fn manager_info(State(state): State<AppState>) -> ApiResult<ManagerInfoResponse> {
    Ok(Json(state.manager().info().await?))
}

pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
