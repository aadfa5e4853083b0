use manager_sdk::protocol::{McpParticipant, ParticipantKind, SessionConfigSpec};

use crate::error::{ManagerError, ManagerResult};
use crate::workers::{LaunchKind, Launcher, RunConfig};

/// Exactly one backend kind must be set.
pub fn validate_config(config: &SessionConfigSpec) -> ManagerResult<()> {
    let kinds = config.kinds_present();
    match kinds.len() {
        1 => Ok(()),
        0 => Err(ManagerError::invalid_request(
            "session config must select exactly one backend",
        )),
        _ => Err(ManagerError::invalid_request(format!(
            "session config selects several backends: {}",
            kinds.join(", ")
        ))),
    }
}

pub fn validate_client(client: &McpParticipant) -> ManagerResult<()> {
    if client.kind != ParticipantKind::Client {
        return Err(ManagerError::invalid_request(
            "mcp_client must be a client participant",
        ));
    }
    if client.info.name.trim().is_empty() {
        return Err(ManagerError::invalid_request("mcp_client.info.name is required"));
    }
    Ok(())
}

/// Turns the session config into concrete run parameters, running the
/// launcher for `*_with_launcher` configs.
pub async fn resolve_run_config(
    session_id: &str,
    config: &SessionConfigSpec,
    launcher: &Launcher,
) -> ManagerResult<RunConfig> {
    validate_config(config)?;
    if let Some(args) = &config.container_with_arguments {
        return Ok(RunConfig::Container(args.clone()));
    }
    if let Some(server) = &config.remote_with_server {
        return Ok(RunConfig::Remote(server.clone()));
    }
    if let Some(server) = &config.lambda_with_server {
        return Ok(RunConfig::Lambda(server.clone()));
    }
    let (kind, params) = if let Some(params) = &config.container_with_launcher {
        (LaunchKind::Container, params)
    } else if let Some(params) = &config.remote_with_launcher {
        (LaunchKind::Remote, params)
    } else if let Some(params) = &config.lambda_with_launcher {
        (LaunchKind::Lambda, params)
    } else {
        return Err(ManagerError::invalid_request(
            "session config must select exactly one backend",
        ));
    };
    launcher.resolve(session_id, kind, params).await
}

#[cfg(test)]
mod tests {
    use manager_sdk::protocol::{ContainerRunConfig, ImplementationInfo, RemoteRunConfig};

    use super::*;
    use crate::error::ErrorKind;
    use crate::workers::WorkerPool;

    #[test]
    fn rejects_zero_or_many_backends() {
        let empty = SessionConfigSpec::default();
        assert_eq!(
            validate_config(&empty).unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );

        let mut both = SessionConfigSpec::container(ContainerRunConfig {
            image: "demo:latest".into(),
            ..Default::default()
        });
        both.remote_with_server = Some(RemoteRunConfig {
            server_uri: "https://mcp.example.com/sse".into(),
            ..Default::default()
        });
        let err = validate_config(&both).unwrap_err();
        assert!(err.message().contains("container_with_arguments"));
        assert!(err.message().contains("remote_with_server"));
    }

    #[test]
    fn rejects_server_as_client() {
        let server = McpParticipant {
            kind: ParticipantKind::Server,
            info: ImplementationInfo {
                name: "x".into(),
                version: "1".into(),
            },
            capabilities: serde_json::json!({}),
            protocol_version: "2024-11-05".into(),
            instructions: None,
        };
        assert!(validate_client(&server).is_err());
    }

    #[tokio::test]
    async fn direct_configs_need_no_launcher() {
        let launcher = Launcher::new(WorkerPool::new());
        let config = SessionConfigSpec::container(ContainerRunConfig {
            image: "demo:latest".into(),
            ..Default::default()
        });
        let run = resolve_run_config("s1", &config, &launcher).await.unwrap();
        assert!(matches!(run, RunConfig::Container(c) if c.image == "demo:latest"));
    }
}
