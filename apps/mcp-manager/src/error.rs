use std::collections::BTreeMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use manager_sdk::ClientError;
use manager_sdk::protocol::ApiErrorBody;
pub use manager_sdk::protocol::ErrorKind;
use manager_sdk::registry::RegistryError;

use crate::audit::AuditError;
use crate::workers::WorkerError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Machine-readable codes attached to errors callers may want to branch on.
pub mod codes {
    pub const OWNER_UNREACHABLE: &str = "owner_unreachable";
    pub const NO_WORKER_AVAILABLE: &str = "no_worker_available";
    pub const MCP_MESSAGE_PROCESSING_FAILED: &str = "mcp_message_processing_failed";
    pub const FAILED_TO_GET_LAUNCH_PARAMS: &str = "failed_to_get_launch_params";
    pub const INVALID_MCP_MESSAGE: &str = "invalid_mcp_message";
    pub const CONNECTION_FAILED: &str = "connection_failed";
    pub const REGISTRY_FAILURE: &str = "registry_failure";
    pub const CLIENT_NOT_INITIALIZED: &str = "client_not_initialized";
    /// Audit code of a launcher failure during `CreateSession`.
    pub const GET_LAUNCH_PARAMS_ERROR: &str = "get_launch_params_error";
}

/// Error returned by every manager RPC: a kind, a human message and optional
/// structured details, with the underlying cause kept as the source.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ManagerError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    details: BTreeMap<String, String>,
    #[source]
    source: Option<BoxError>,
}

impl ManagerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: BTreeMap::new(),
            source: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::not_found("session not found").with_detail("session_id", session_id)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Conflict => StatusCode::CONFLICT,
        }
    }

    pub fn to_body(&self) -> ApiErrorBody {
        ApiErrorBody {
            error: self.kind,
            code: self.code.clone(),
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }

    /// Rebuilds an error relayed by a peer manager.
    pub fn from_body(body: ApiErrorBody) -> Self {
        Self {
            kind: body.error,
            message: body.message,
            code: body.code,
            details: body.details,
            source: None,
        }
    }

    /// Full cause chain, used when persisting audit error rows.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(err) = current {
            out.push_str(": ");
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }
}

impl From<RegistryError> for ManagerError {
    fn from(err: RegistryError) -> Self {
        ManagerError::internal("session registry failure")
            .with_code(codes::REGISTRY_FAILURE)
            .with_source(err)
    }
}

impl From<WorkerError> for ManagerError {
    fn from(err: WorkerError) -> Self {
        ManagerError::internal("worker failure").with_source(err)
    }
}

impl From<AuditError> for ManagerError {
    fn from(err: AuditError) -> Self {
        ManagerError::internal("audit persistence failure").with_source(err)
    }
}

impl From<ClientError> for ManagerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api { body, .. } => ManagerError::from_body(body),
            other if other.is_unreachable() => {
                ManagerError::internal("owning manager unreachable")
                    .with_code(codes::OWNER_UNREACHABLE)
                    .with_source(other)
            }
            other => ManagerError::internal("peer manager call failed").with_source(other),
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_kinds_to_status_codes() {
        assert_eq!(
            ManagerError::invalid_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ManagerError::session_not_found("s1").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ManagerError::timeout("x").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn body_carries_code_and_details() {
        let err = ManagerError::session_not_found("s1").with_code("gone");
        let body = err.to_body();
        assert_eq!(body.error, ErrorKind::NotFound);
        assert_eq!(body.code.as_deref(), Some("gone"));
        assert_eq!(body.details.get("session_id").map(String::as_str), Some("s1"));
    }

    #[test]
    fn registry_errors_become_internal_with_cause() {
        let err: ManagerError = RegistryError::Store("connection reset".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.has_code(codes::REGISTRY_FAILURE));
        assert!(err.chain().contains("connection reset"));
    }
}
