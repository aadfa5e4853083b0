use std::sync::Arc;

use manager_sdk::protocol::{
    ContainerRunConfig, LambdaRunConfig, LauncherConfig, RemoteRunConfig, WorkerType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RunConfig, WorkerError, WorkerPool};
use crate::error::{codes, ManagerError, ManagerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    Container,
    Remote,
    Lambda,
}

/// Body posted to a launcher worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherRequest {
    pub session_id: String,
    pub kind: LaunchKind,
    pub launcher: LauncherConfig,
}

/// Resolves `*_with_launcher` configs into concrete run parameters through a
/// randomly picked launcher worker.
#[derive(Clone)]
pub struct Launcher {
    pool: Arc<WorkerPool>,
}

impl Launcher {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub async fn resolve(
        &self,
        session_id: &str,
        kind: LaunchKind,
        launcher: &LauncherConfig,
    ) -> ManagerResult<RunConfig> {
        let request = LauncherRequest {
            session_id: session_id.to_string(),
            kind,
            launcher: launcher.clone(),
        };
        let fail = |message: String| {
            ManagerError::invalid_request(message)
                .with_code(codes::FAILED_TO_GET_LAUNCH_PARAMS)
                .with_detail("session_id", session_id)
        };

        let worker = self
            .pool
            .pick_worker_randomly(WorkerType::Launcher)
            .ok_or_else(|| fail(WorkerError::NoWorkerAvailable(WorkerType::Launcher).to_string()))?;
        debug!(session_id, worker_id = %worker.worker_id(), ?kind, "running launcher");

        let params = worker.run_launcher(&request).await.map_err(|err| {
            warn!(session_id, worker_id = %worker.worker_id(), error = %err, "launcher failed");
            fail(format!("launcher failed: {err}")).with_source(err)
        })?;
        parse_launch_params(kind, params).map_err(|err| {
            fail(format!("launcher returned invalid parameters: {err}")).with_source(err)
        })
    }
}

pub fn parse_launch_params(
    kind: LaunchKind,
    params: serde_json::Value,
) -> Result<RunConfig, serde_json::Error> {
    Ok(match kind {
        LaunchKind::Container => {
            RunConfig::Container(serde_json::from_value::<ContainerRunConfig>(params)?)
        }
        LaunchKind::Remote => RunConfig::Remote(serde_json::from_value::<RemoteRunConfig>(params)?),
        LaunchKind::Lambda => RunConfig::Lambda(serde_json::from_value::<LambdaRunConfig>(params)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn parses_params_per_kind() {
        let run = parse_launch_params(
            LaunchKind::Container,
            json!({"image": "demo:latest", "args": ["--stdio"]}),
        )
        .unwrap();
        assert!(matches!(run, RunConfig::Container(c) if c.args == vec!["--stdio".to_string()]));

        assert!(parse_launch_params(LaunchKind::Remote, json!({"image": "x"})).is_err());
    }

    #[tokio::test]
    async fn missing_launcher_worker_is_invalid_request() {
        let launcher = Launcher::new(WorkerPool::new());
        let err = launcher
            .resolve("s1", LaunchKind::Container, &LauncherConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.has_code(codes::FAILED_TO_GET_LAUNCH_PARAMS));
    }
}
